//! CPU affinity utilities for pinning threads to specific cores.

use std::io;

/// Pin the calling thread to a single CPU.
///
/// On Linux, this uses `sched_setaffinity`. Other platforms report `Unsupported`.
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(cpu_id: usize) -> io::Result<()> {
    use std::mem;

    if cpu_id >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cpu {} exceeds CPU_SETSIZE", cpu_id),
        ));
    }

    unsafe {
        let mut cpu_set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(cpu_id, &mut cpu_set);

        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpu_set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(cpu_id: usize) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot pin to cpu {}: thread affinity is not supported on this platform", cpu_id),
    ))
}

/// CPUs the calling thread is currently allowed to run on.
#[cfg(target_os = "linux")]
pub fn allowed_cpus() -> io::Result<Vec<usize>> {
    use std::mem;

    let cpu_set = unsafe {
        let mut cpu_set: libc::cpu_set_t = mem::zeroed();
        if libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut cpu_set) != 0 {
            return Err(io::Error::last_os_error());
        }
        cpu_set
    };

    Ok((0..libc::CPU_SETSIZE as usize)
        .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &cpu_set) })
        .collect())
}

#[cfg(not(target_os = "linux"))]
pub fn allowed_cpus() -> io::Result<Vec<usize>> {
    Ok((0..num_cpus::get()).collect())
}
