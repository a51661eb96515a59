//! Process-wide signal → pollable-event bridge (spec §6, "Signal
//! delivery"). An OS signal handler cannot safely do more than write a
//! byte, so the handler just picks one interested base's self-pipe
//! (round-robin, per spec) and writes the signal number into it; the
//! owning base reads the pipe from inside its own dispatch loop and
//! turns it into ordinary event activations.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use libc::c_int;
use std::sync::OnceLock;

struct Registry {
    // signum -> pipe write fds of every base currently watching it, plus
    // the index of the next one to receive a delivery.
    subscribers: HashMap<i32, (Vec<RawFd>, usize)>,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            subscribers: HashMap::new(),
        })
    })
}

extern "C" fn trampoline(signum: c_int) {
    let reg = registry();
    // A signal handler must not block or panic; `try_lock` degrades to a
    // dropped delivery rather than risking deadlock/reentrancy.
    if let Ok(mut guard) = reg.try_lock() {
        if let Some((fds, next)) = guard.subscribers.get_mut(&signum) {
            if !fds.is_empty() {
                let idx = *next % fds.len();
                *next = (*next + 1) % fds.len();
                let fd = fds[idx];
                let byte = [signum as u8];
                unsafe {
                    let _ = libc::write(fd, byte.as_ptr() as *const _, 1);
                }
            }
        }
    }
}

/// Subscribes `pipe_write_fd` to receive byte-sized deliveries of
/// `signum`, installing the process-wide handler on first use.
pub fn register_signal(signum: i32, pipe_write_fd: RawFd) -> io::Result<()> {
    let mut guard = registry().lock().unwrap();
    let entry = guard.subscribers.entry(signum).or_insert_with(|| (Vec::new(), 0));
    let was_empty = entry.0.is_empty();
    entry.0.push(pipe_write_fd);
    drop(guard);

    if was_empty {
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = trampoline as *const () as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// Removes `pipe_write_fd` from `signum`'s subscriber list, restoring the
/// default disposition once nobody is watching it anymore.
pub fn unregister_signal(signum: i32, pipe_write_fd: RawFd) {
    let mut guard = registry().lock().unwrap();
    if let Some(entry) = guard.subscribers.get_mut(&signum) {
        entry.0.retain(|&fd| fd != pipe_write_fd);
        entry.1 = 0;
        if entry.0.is_empty() {
            guard.subscribers.remove(&signum);
            drop(guard);
            unsafe {
                libc::signal(signum, libc::SIG_DFL);
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::FromRawFd;

    #[test]
    fn delivers_to_registered_pipe() {
        let mut fds = [0i32; 2];
        unsafe {
            assert_eq!(libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK), 0);
        }
        register_signal(libc::SIGUSR1, fds[1]).unwrap();
        unsafe {
            libc::raise(libc::SIGUSR1);
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut read_end = unsafe { std::fs::File::from_raw_fd(fds[0]) };
        use std::io::Read;
        let mut buf = [0u8; 1];
        let n = read_end.read(&mut buf).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0] as i32, libc::SIGUSR1);
        unregister_signal(libc::SIGUSR1, fds[1]);
    }
}
