/**
 * Data model for secrets as served by the backend,
 *  including the base64 wire encoding.
 */
pub mod secret;
/**
 * Injectable time source. Freshness and TTL checks
 *  route through it so tests can advance time.
 */
pub mod clock;
/**
 * Thread-safe keyed store with delayed-deletion TTLs.
 * Holds the last known good copy of every secret.
 */
pub mod store;
/**
 * Interface to the server of record, plus its error
 *  taxonomy.
 */
pub mod backend;
/**
 * The coordinator: serves lookups and listings from
 *  the store, the backend, or both, under tiered
 *  timeouts.
 */
pub mod cache;
/**
 * Test doubles (scripted backends, mock clock) for
 *  exercising the cache without a server.
 */
pub mod testkit;

pub mod prelude {
    pub use crate::backend::{BackendError, SecretBackend};
    pub use crate::cache::{Cache, CacheError, Timeouts};
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::secret::{Secret, SecretContent};
    pub use crate::store::{CacheEntry, SecretStore};
}
