//! Per-client single-flight gate.
//!
//! At most one admitted request per client address is in flight at any instant. A
//! request that arrives while its address is busy is rejected; the server answers it
//! with an empty `200 OK` instead of running the cascade.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared admission state. Cloning shares the same set of busy addresses.
#[derive(Clone, Debug, Default)]
pub struct AdmissionController {
    busy: Arc<Mutex<HashSet<IpAddr>>>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `client` busy. Returns false when it already was.
    ///
    /// Check and insert happen under one lock, so two racing requests from the same
    /// address cannot both be admitted.
    pub fn admit(&self, client: IpAddr) -> bool {
        self.lock().insert(client)
    }

    /// Clear the busy mark for `client`.
    pub fn release(&self, client: IpAddr) {
        self.lock().remove(&client);
    }

    /// Admit and return a guard that releases the address when dropped.
    pub fn try_admit(&self, client: IpAddr) -> Option<AdmissionGuard> {
        if self.admit(client) {
            Some(AdmissionGuard {
                controller: self.clone(),
                client,
            })
        } else {
            None
        }
    }

    pub fn is_busy(&self, client: IpAddr) -> bool {
        self.lock().contains(&client)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<IpAddr>> {
        // Set operations never leave the set partially updated.
        self.busy.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Admitted request. Dropping it (after the response is written, on success or
/// failure) releases the client address.
#[derive(Debug)]
pub struct AdmissionGuard {
    controller: AdmissionController,
    client: IpAddr,
}

impl AdmissionGuard {
    pub fn client(&self) -> IpAddr {
        self.client
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.controller.release(self.client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Barrier;

    const CLIENT_A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const CLIENT_B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    #[test]
    fn second_admit_for_same_client_is_rejected() {
        let admission = AdmissionController::new();
        assert!(admission.admit(CLIENT_A));
        assert!(!admission.admit(CLIENT_A));
        assert!(admission.admit(CLIENT_B));
        assert_eq!(admission.in_flight(), 2);

        admission.release(CLIENT_A);
        assert!(!admission.is_busy(CLIENT_A));
        assert!(admission.admit(CLIENT_A));
    }

    #[test]
    fn guard_releases_on_drop() {
        let admission = AdmissionController::new();
        let guard = admission.try_admit(CLIENT_A).unwrap();
        assert_eq!(guard.client(), CLIENT_A);
        assert!(admission.try_admit(CLIENT_A).is_none());
        drop(guard);
        assert!(admission.try_admit(CLIENT_A).is_some());
        // Temporary guard above was dropped at end of statement.
        assert_eq!(admission.in_flight(), 0);
    }

    #[test]
    fn concurrent_admits_for_one_client_admit_exactly_one() {
        let admission = AdmissionController::new();
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let admission = admission.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    admission.admit(CLIENT_A)
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 1);
    }
}
