//! OpenCL device engine
//!
//! Devices are numbered across every OpenCL platform in enumeration order,
//! GPUs only. The verification table is uploaded once per device; each search
//! step writes the header hash and enqueues the `czzhash_search` kernel once per
//! nonce, reading back the 32-byte output. For a qualifying output the nonce the
//! kernel wrote to its echo buffer is the one reported.
//!
//! Kernel arguments:
//! 0. output buffer (32 bytes, written by the kernel)
//! 1. header hash buffer (32 bytes)
//! 2. verification table buffer
//! 3. nonce (`u64`)
//! 4. target (`u64`)
//! 5. isolate (`u32`, always `0xFFFFFFFF`)
//! 6. nonce echo buffer (`u64`, written by the kernel, holds the solving nonce)

use super::{BatchOutcome, EngineFactory, SearchEngine};
use crate::table::VerificationTable;
use crate::{DeviceId, Error, Hash, Nonce, Result, Target, HASH_LENGTH};
use ocl::enums::{DeviceInfo, DeviceInfoResult};
use ocl::{flags, Buffer, Context, Device, Kernel, Platform, Program, Queue};
use std::path::Path;
use tracing::{debug, info, warn};

/// Kernel entry point in the program source
pub const KERNEL_NAME: &str = "czzhash_search";

const ISOLATE: u32 = 0xFFFF_FFFF;

fn cl_error(device: DeviceId) -> impl Fn(ocl::Error) -> Error {
    move |e| Error::device(device, e.to_string())
}

/// Every GPU visible through any OpenCL platform
fn gpu_devices() -> Vec<(Platform, Device)> {
    let mut found = Vec::new();
    for platform in Platform::list() {
        match Device::list(&platform, Some(flags::DEVICE_TYPE_GPU)) {
            Ok(devices) => found.extend(devices.into_iter().map(|d| (platform.clone(), d))),
            Err(e) => debug!("Skipping OpenCL platform without GPUs: {}", e),
        }
    }
    found
}

/// Factory compiling the search kernel for each requested GPU
pub struct OpenClFactory {
    source: String,
}

impl OpenClFactory {
    /// Use kernel source already in memory
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Read kernel source from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read kernel {}: {}", path.display(), e))
        })?;
        if !source.contains(KERNEL_NAME) {
            return Err(Error::config(format!(
                "Kernel {} does not define {}",
                path.display(),
                KERNEL_NAME
            )));
        }
        Ok(Self::from_source(source))
    }
}

impl EngineFactory for OpenClFactory {
    fn kind(&self) -> &'static str {
        "opencl"
    }

    fn initialize(
        &self,
        device: DeviceId,
        table: &VerificationTable,
    ) -> Result<Box<dyn SearchEngine>> {
        let devices = gpu_devices();
        let (platform, handle) = devices.get(device).cloned().ok_or_else(|| {
            Error::device(
                device,
                format!("no OpenCL GPU with this index ({} found)", devices.len()),
            )
        })?;
        let err = cl_error(device);

        let device_name = handle.name().map_err(|e| err(e.into()))?;
        let version = handle
            .info(DeviceInfo::Version)
            .map_err(|e| err(e.into()))?
            .to_string();
        if version.trim_start().starts_with("OpenCL 1.0") {
            return Err(Error::device(
                device,
                format!("{} is not supported", version.trim()),
            ));
        }

        // Drivers sometimes under-report memory, so these only warn.
        let table_size = table.len() as u64;
        if let Ok(DeviceInfoResult::GlobalMemSize(size)) = handle.info(DeviceInfo::GlobalMemSize) {
            if size < table_size {
                warn!(device, "Device memory may be insufficient: {} bytes, table needs {}", size, table_size);
            }
        }
        if let Ok(DeviceInfoResult::MaxMemAllocSize(size)) = handle.info(DeviceInfo::MaxMemAllocSize) {
            if size < table_size {
                warn!(device, "Table ({} bytes) exceeds max allocation size ({} bytes)", table_size, size);
            }
        }

        let context = Context::builder()
            .platform(platform)
            .devices(handle)
            .build()
            .map_err(&err)?;
        let queue = Queue::new(&context, handle, None).map_err(&err)?;
        let program = Program::builder()
            .src(self.source.as_str())
            .devices(handle)
            .build(&context)
            .map_err(&err)?;

        let table_buf = Buffer::<u8>::builder()
            .queue(queue.clone())
            .flags(flags::MEM_READ_ONLY)
            .len(table.len())
            .copy_host_slice(table.as_bytes())
            .build()
            .map_err(&err)?;
        let header_buf = Buffer::<u8>::builder()
            .queue(queue.clone())
            .flags(flags::MEM_READ_ONLY)
            .len(HASH_LENGTH)
            .build()
            .map_err(&err)?;
        let output_buf = Buffer::<u8>::builder()
            .queue(queue.clone())
            .flags(flags::MEM_WRITE_ONLY)
            .len(HASH_LENGTH)
            .build()
            .map_err(&err)?;
        let nonce_buf = Buffer::<u64>::builder()
            .queue(queue.clone())
            .flags(flags::MEM_WRITE_ONLY)
            .len(1)
            .build()
            .map_err(&err)?;

        let kernel = Kernel::builder()
            .program(&program)
            .name(KERNEL_NAME)
            .queue(queue.clone())
            .global_work_size(1)
            .arg(&output_buf)
            .arg(&header_buf)
            .arg(&table_buf)
            .arg_named("nonce", &0u64)
            .arg_named("target", &0u64)
            .arg(&ISOLATE)
            .arg(&nonce_buf)
            .build()
            .map_err(&err)?;

        info!(device, "Initialized {} ({})", device_name, version.trim());
        Ok(Box::new(OpenClEngine {
            device,
            name: device_name,
            queue,
            kernel,
            header_buf,
            output_buf,
            _table_buf: table_buf,
            nonce_buf,
        }))
    }
}

/// One GPU with the table resident in device memory
pub struct OpenClEngine {
    device: DeviceId,
    name: String,
    queue: Queue,
    kernel: Kernel,
    header_buf: Buffer<u8>,
    output_buf: Buffer<u8>,
    _table_buf: Buffer<u8>,
    nonce_buf: Buffer<u64>,
}

impl SearchEngine for OpenClEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn search_batch(
        &mut self,
        header: &Hash,
        target: Target,
        start: Nonce,
        count: u64,
    ) -> Result<BatchOutcome> {
        let err = cl_error(self.device);

        self.header_buf
            .write(&header.as_bytes()[..])
            .enq()
            .map_err(&err)?;
        self.kernel
            .set_arg("target", &target.value())
            .map_err(&err)?;

        let mut output = vec![0u8; HASH_LENGTH];
        let mut echoed = vec![0u64; 1];
        for offset in 0..count {
            let nonce = start.advanced(offset);
            self.kernel
                .set_arg("nonce", &nonce.value())
                .map_err(&err)?;
            unsafe {
                self.kernel.enq().map_err(&err)?;
            }
            self.output_buf.read(&mut output).enq().map_err(&err)?;

            let candidate = Hash::from_slice(&output);
            if target.is_met_by(&candidate) {
                self.nonce_buf.read(&mut echoed).enq().map_err(&err)?;
                let solved = Nonce::new(echoed[0]);
                if solved != nonce {
                    debug!(device = self.device, sent = %nonce, solved = %solved, "Kernel reported a different nonce");
                }
                return Ok(BatchOutcome::hit(offset + 1, solved, candidate));
            }
        }
        self.queue.finish().map_err(&err)?;
        Ok(BatchOutcome::miss(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TABLE_SIZE;

    /// Zero output for every nonce, echoing `nonce + 1000`
    const ECHO_KERNEL: &str = r#"
        __kernel void czzhash_search(__global uchar* output, __global const uchar* header,
                                     __global const uchar* table, ulong nonce, ulong target,
                                     uint isolate, __global ulong* found) {
            for (int i = 0; i < 32; i++) { output[i] = 0; }
            found[0] = nonce + 1000;
        }
    "#;

    #[test]
    fn test_kernel_source_must_define_entry_point() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"__kernel void other() {}").unwrap();
        assert!(OpenClFactory::from_file(file.path()).is_err());
    }

    #[test]
    #[ignore = "requires an OpenCL GPU"]
    fn test_solution_uses_kernel_nonce() {
        let table = VerificationTable::from_bytes(vec![0u8; TABLE_SIZE]).unwrap();
        let mut engine = OpenClFactory::from_source(ECHO_KERNEL)
            .initialize(0, &table)
            .unwrap();

        let outcome = engine
            .search_batch(&Hash::default(), Target::max(), Nonce::new(5), 4)
            .unwrap();
        assert_eq!(outcome.attempted, 1);
        assert_eq!(outcome.candidate.unwrap().nonce, Nonce::new(1005));
    }
}
