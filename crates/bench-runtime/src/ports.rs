//! TCP port allocation for server instances and the proxy

use bench_core::{Error, Result};
use std::net::TcpListener;
use tracing::debug;

/// Attempts made to find a contiguous free range before giving up
const RANGE_ATTEMPTS: usize = 32;

/// Check if a port is available on `host`
pub fn is_port_available(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// Ask the OS for a free port on `host`.
///
/// The port is released before returning, so another process may still
/// claim it before the caller binds.
pub fn pick_free_port(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Find a base port such that `base..base+count` are all free on `host`
pub fn find_free_port_range(host: &str, count: usize) -> Result<u16> {
    if count == 0 {
        return Err(Error::config("port range must cover at least one port"));
    }

    for _ in 0..RANGE_ATTEMPTS {
        let base = pick_free_port(host)?;
        let fits = (base as usize) + count - 1 <= u16::MAX as usize;
        if fits && (1..count).all(|offset| is_port_available(host, base + offset as u16)) {
            debug!(base, count, "Picked free port range");
            return Ok(base);
        }
    }

    Err(Error::launch(format!(
        "no free range of {} consecutive ports on {}",
        count, host
    )))
}

/// Ports `base..base+count`, failing when the range overflows
pub fn port_range(base: u16, count: usize) -> Result<Vec<u16>> {
    (0..count)
        .map(|offset| {
            u16::try_from(offset)
                .ok()
                .and_then(|offset| base.checked_add(offset))
                .ok_or_else(|| {
                    Error::config(format!(
                        "{} ports starting at {} exceed the port space",
                        count, base
                    ))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_free_port_is_bindable() {
        let port = pick_free_port("127.0.0.1").unwrap();
        assert!(port > 0);
        assert!(is_port_available("127.0.0.1", port));
    }

    #[test]
    fn test_occupied_port_is_unavailable() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available("127.0.0.1", port));
    }

    #[test]
    fn test_find_free_port_range() {
        let base = find_free_port_range("127.0.0.1", 3).unwrap();
        for offset in 0..3 {
            assert!(is_port_available("127.0.0.1", base + offset));
        }
        assert!(find_free_port_range("127.0.0.1", 0).is_err());
    }

    #[test]
    fn test_port_range() {
        assert_eq!(port_range(9000, 3).unwrap(), vec![9000, 9001, 9002]);
        assert!(port_range(65535, 2).is_err());
        assert!(port_range(9000, 0).unwrap().is_empty());
    }
}
