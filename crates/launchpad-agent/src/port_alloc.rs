use std::{
    collections::BTreeSet,
    io::ErrorKind,
    net::TcpListener,
    sync::Mutex,
};

use crate::error::{DemoError, DemoResult};

/// Owns the fixed demo port range. The only component allowed to mutate the pool.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    used: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            min,
            max,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    pub fn capacity(&self) -> usize {
        (self.max as usize) - (self.min as usize) + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    /// Hands out the lowest port not currently held.
    pub fn acquire(&self) -> DemoResult<u16> {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        let port = (self.min..=self.max)
            .find(|p| !used.contains(p))
            .ok_or(DemoError::PortExhausted {
                min: self.min,
                max: self.max,
            })?;
        used.insert(port);
        Ok(port)
    }

    /// Marks a specific port as held. Returns false when it is out of range or already held.
    pub fn claim(&self, port: u16) -> bool {
        if !self.contains(port) {
            return false;
        }
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        used.insert(port)
    }

    /// Returns the port to the pool. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) -> bool {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        used.remove(&port)
    }

    pub fn is_used(&self, port: u16) -> bool {
        let used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        used.contains(&port)
    }

    pub fn list_used(&self) -> BTreeSet<u16> {
        self.used.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn available(&self) -> usize {
        let used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        self.capacity().saturating_sub(used.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindProbe {
    Free,
    InUse,
    Unavailable(String),
}

/// Checks at the OS level whether something is already listening on `port`.
pub fn probe_bind(port: u16) -> BindProbe {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => {
            l.set_nonblocking(true).ok();
            BindProbe::Free
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => BindProbe::InUse,
        Err(e) => BindProbe::Unavailable(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_hands_out_lowest_free_port() {
        let pool = PortAllocator::new(8501, 8503);
        assert_eq!(pool.acquire().unwrap(), 8501);
        assert_eq!(pool.acquire().unwrap(), 8502);
        pool.release(8501);
        assert_eq!(pool.acquire().unwrap(), 8501);
        assert_eq!(pool.acquire().unwrap(), 8503);
    }

    #[test]
    fn acquire_reports_exhaustion_without_changing_pool() {
        let pool = PortAllocator::new(8501, 8502);
        pool.acquire().unwrap();
        pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(
            err,
            DemoError::PortExhausted {
                min: 8501,
                max: 8502
            }
        ));
        assert_eq!(pool.list_used().len(), 2);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn release_is_idempotent() {
        let pool = PortAllocator::new(8501, 8501);
        let p = pool.acquire().unwrap();
        assert!(pool.release(p));
        assert!(!pool.release(p));
        assert!(!pool.release(9999));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn claim_fences_specific_ports() {
        let pool = PortAllocator::new(8501, 8503);
        assert!(pool.claim(8501));
        assert!(!pool.claim(8501));
        assert!(!pool.claim(9000));
        assert_eq!(pool.acquire().unwrap(), 8502);
    }

    #[test]
    fn concurrent_acquire_never_duplicates() {
        let pool = Arc::new(PortAllocator::new(20_000, 20_063));
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.acquire().unwrap())
            })
            .collect();
        let mut ports: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 64);
        assert!(pool.acquire().is_err());
    }

    #[test]
    fn probe_bind_detects_listener() {
        let Ok(listener) = TcpListener::bind(("0.0.0.0", 0)) else {
            return;
        };
        let port = listener.local_addr().unwrap().port();
        assert_eq!(probe_bind(port), BindProbe::InUse);
        drop(listener);
    }
}
