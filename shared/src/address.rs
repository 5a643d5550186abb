use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use thiserror::Error;

use crate::error::{AppError, ErrorKind};
use crate::model::Coordinate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAddress {
    pub formatted: String,
    pub short: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no address found for coordinate")]
    NotFound,
    #[error("address lookup failed: {0}")]
    Failed(String),
}

impl From<ResolveError> for AppError {
    fn from(e: ResolveError) -> Self {
        AppError::new(ErrorKind::AddressLookup, e.to_string())
    }
}

/// Reverse geocoder. Treated as a black box.
#[async_trait::async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, coordinate: Coordinate) -> Result<ResolvedAddress, ResolveError>;
}

/// Resolved addresses keyed by coordinates rounded to a grid.
pub struct AddressCache {
    entries: LruCache<(i64, i64), ResolvedAddress>,
    precision: u32,
}

impl AddressCache {
    pub fn new(capacity: usize, precision: u32) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            precision,
        }
    }

    pub fn get(&mut self, coordinate: Coordinate) -> Option<ResolvedAddress> {
        self.entries.get(&coordinate.grid_key(self.precision)).cloned()
    }

    pub fn put(&mut self, coordinate: Coordinate, address: ResolvedAddress) {
        self.entries.put(coordinate.grid_key(self.precision), address);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolveTicket {
    pub seq: u64,
    pub coordinate: Coordinate,
}

/// Latest-sample-wins scheduling of address lookups.
///
/// At most one lookup is in flight. Samples offered meanwhile overwrite a
/// single pending slot, so only the newest one is resolved next.
#[derive(Debug, Default)]
pub struct AddressDebouncer {
    next_seq: u64,
    in_flight: Option<u64>,
    pending: Option<Coordinate>,
    valid_from: u64,
}

impl AddressDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a ticket to resolve now, or parks the coordinate.
    pub fn offer(&mut self, coordinate: Coordinate) -> Option<ResolveTicket> {
        if self.in_flight.is_some() {
            self.pending = Some(coordinate);
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight = Some(seq);
        Some(ResolveTicket { seq, coordinate })
    }

    /// Marks `seq` done. Returns whether its result is still wanted.
    pub fn finish(&mut self, seq: u64) -> bool {
        if self.in_flight == Some(seq) {
            self.in_flight = None;
        }
        seq >= self.valid_from
    }

    /// Ticket for the parked coordinate, once nothing is in flight.
    pub fn take_pending(&mut self) -> Option<ResolveTicket> {
        if self.in_flight.is_some() {
            return None;
        }
        let coordinate = self.pending.take()?;
        self.offer(coordinate)
    }

    /// Drops the parked coordinate and invalidates the in-flight lookup.
    pub fn reset(&mut self) {
        self.pending = None;
        self.valid_from = self.next_seq;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }
}
