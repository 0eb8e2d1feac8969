//! Connection admission and per-connection flood control
//!
//! Connection limits are always enforced. Packet-rate limiting is compiled in
//! with the `dos_ratelimit` feature.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use hashbrown::HashMap;

/// Limits applied to incoming connections
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Maximum concurrent connections (logged in or not)
    pub max_users: usize,
    pub max_connections_per_ip: usize,
    /// Packets allowed per window per connection
    pub max_packets_per_window: u32,
    pub rate_window: Duration,
    /// Windows over the limit before the connection is dropped
    pub max_violations: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_users: 500,
            max_connections_per_ip: 4,
            max_packets_per_window: 60,
            rate_window: Duration::from_secs(1),
            max_violations: 3,
        }
    }
}

#[derive(Debug)]
struct PacketRate {
    window_start: Instant,
    count: u32,
    violations: u32,
    /// Already counted a violation for the current window
    flagged: bool,
}

impl PacketRate {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            violations: 0,
            flagged: false,
        }
    }

    /// Count one packet. Returns false when the window is over its limit.
    fn record(&mut self, now: Instant, limit: u32, window: Duration) -> bool {
        if now.saturating_duration_since(self.window_start) >= window {
            self.window_start = now;
            self.count = 0;
            self.flagged = false;
        }
        self.count += 1;
        if self.count <= limit {
            return true;
        }
        if !self.flagged {
            self.flagged = true;
            self.violations += 1;
        }
        false
    }
}

/// Bookkeeping for every open connection
pub struct Admission {
    config: AdmissionConfig,
    next_id: u64,
    per_ip: HashMap<IpAddr, usize>,
    rates: HashMap<u64, PacketRate>,
}

impl Admission {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            next_id: 1,
            per_ip: HashMap::new(),
            rates: HashMap::new(),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Accept a connection from `ip` and give it an id
    pub fn admit(&mut self, ip: IpAddr) -> Result<u64, DoSError> {
        if self.rates.len() >= self.config.max_users {
            return Err(DoSError::ServerFull);
        }
        let from_ip = self.per_ip.get(&ip).copied().unwrap_or(0);
        if from_ip >= self.config.max_connections_per_ip {
            return Err(DoSError::TooManyConnectionsFromIp(ip));
        }

        let id = self.next_id;
        self.next_id += 1;
        *self.per_ip.entry(ip).or_insert(0) += 1;
        self.rates.insert(id, PacketRate::new(Instant::now()));
        Ok(id)
    }

    /// Forget a connection. Unknown ids are ignored.
    pub fn release(&mut self, id: u64, ip: IpAddr) {
        if self.rates.remove(&id).is_none() {
            return;
        }
        if let Some(count) = self.per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_ip.remove(&ip);
            }
        }
    }

    /// Account for one decoded packet
    ///
    /// `Err(RateLimited)` means the packet should be dropped; once the
    /// connection has exceeded the limit in too many windows the answer is
    /// `Err(TooManyViolations)` and the connection should be closed.
    #[cfg(feature = "dos_ratelimit")]
    pub fn check_packet(&mut self, id: u64, now: Instant) -> Result<(), DoSError> {
        let Some(rate) = self.rates.get_mut(&id) else {
            return Ok(());
        };
        if rate.violations >= self.config.max_violations {
            return Err(DoSError::TooManyViolations);
        }
        if rate.record(now, self.config.max_packets_per_window, self.config.rate_window) {
            return Ok(());
        }
        if rate.violations >= self.config.max_violations {
            Err(DoSError::TooManyViolations)
        } else {
            Err(DoSError::RateLimited)
        }
    }

    #[cfg(not(feature = "dos_ratelimit"))]
    pub fn check_packet(&mut self, _id: u64, _now: Instant) -> Result<(), DoSError> {
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.rates.len()
    }

    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.per_ip.get(&ip).copied().unwrap_or(0)
    }
}

impl Default for Admission {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DoSError {
    #[error("Server is full")]
    ServerFull,
    #[error("Too many connections from {0}")]
    TooManyConnectionsFromIp(IpAddr),
    #[error("Packet rate exceeded")]
    RateLimited,
    #[error("Packet rate exceeded too often")]
    TooManyViolations,
}

impl DoSError {
    /// Whether the connection must be closed
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DoSError::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_admit_and_release() {
        let mut admission = Admission::default();
        let a = admission.admit(ip(1)).unwrap();
        let b = admission.admit(ip(1)).unwrap();
        assert_ne!(a, b);
        assert_eq!(admission.connection_count(), 2);
        assert_eq!(admission.connections_from(ip(1)), 2);

        admission.release(a, ip(1));
        admission.release(a, ip(1));
        assert_eq!(admission.connection_count(), 1);
        assert_eq!(admission.connections_from(ip(1)), 1);
    }

    #[test]
    fn test_per_ip_limit() {
        let mut admission = Admission::new(AdmissionConfig {
            max_connections_per_ip: 1,
            ..Default::default()
        });
        admission.admit(ip(1)).unwrap();
        assert_eq!(
            admission.admit(ip(1)),
            Err(DoSError::TooManyConnectionsFromIp(ip(1)))
        );
        assert!(admission.admit(ip(2)).is_ok());
    }

    #[test]
    fn test_server_full() {
        let mut admission = Admission::new(AdmissionConfig {
            max_users: 2,
            ..Default::default()
        });
        admission.admit(ip(1)).unwrap();
        admission.admit(ip(2)).unwrap();
        assert_eq!(admission.admit(ip(3)), Err(DoSError::ServerFull));
        assert!(DoSError::ServerFull.is_fatal());
    }

    #[cfg(feature = "dos_ratelimit")]
    #[test]
    fn test_rate_limit_escalates_to_disconnect() {
        let mut admission = Admission::new(AdmissionConfig {
            max_packets_per_window: 2,
            rate_window: Duration::from_secs(1),
            max_violations: 2,
            ..Default::default()
        });
        let id = admission.admit(ip(1)).unwrap();
        let start = Instant::now();

        assert!(admission.check_packet(id, start).is_ok());
        assert!(admission.check_packet(id, start).is_ok());
        assert_eq!(admission.check_packet(id, start), Err(DoSError::RateLimited));
        // Further packets in the same window do not add violations
        assert_eq!(admission.check_packet(id, start), Err(DoSError::RateLimited));

        let later = start + Duration::from_secs(2);
        assert!(admission.check_packet(id, later).is_ok());
        assert!(admission.check_packet(id, later).is_ok());
        assert_eq!(
            admission.check_packet(id, later),
            Err(DoSError::TooManyViolations)
        );
        assert!(DoSError::TooManyViolations.is_fatal());
    }
}
