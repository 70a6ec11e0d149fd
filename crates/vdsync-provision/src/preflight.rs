use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;
use vdsync_vdisplay::command::run;

/// Host facts checked before a transaction touches anything.
pub trait HostProbe {
    fn is_elevated(&self) -> bool;
    fn network_reachable(&self) -> bool;
    /// Human-readable description of what `network_reachable` probes.
    fn network_probe(&self) -> String;
}

/// Probes the real host.
pub struct SystemProbe {
    address: String,
    timeout: Duration,
}

impl SystemProbe {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }
}

impl HostProbe for SystemProbe {
    #[cfg(windows)]
    fn is_elevated(&self) -> bool {
        // `net session` is refused for non-administrators.
        run("net", ["session"]).map(|o| o.success()).unwrap_or(false)
    }

    #[cfg(not(windows))]
    fn is_elevated(&self) -> bool {
        run("id", ["-u"])
            .map(|o| o.success() && o.stdout.trim() == "0")
            .unwrap_or(false)
    }

    fn network_reachable(&self) -> bool {
        let addrs = match self.address.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(address = %self.address, error = %e, "Probe address did not resolve");
                return false;
            }
        };
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => return true,
                Err(e) => debug!(%addr, error = %e, "Probe connect failed"),
            }
        }
        false
    }

    fn network_probe(&self) -> String {
        self.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn reachable_when_something_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let probe = SystemProbe::new(addr.to_string(), Duration::from_secs(1));
        assert!(probe.network_reachable());
    }

    #[test]
    fn unresolvable_address_is_unreachable() {
        let probe = SystemProbe::new("not a host name", Duration::from_millis(100));
        assert!(!probe.network_reachable());
        assert_eq!(probe.network_probe(), "not a host name");
    }
}
