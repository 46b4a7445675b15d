//! # Notary API
//!
//! HTTP surface for submitting attestations, verifying receipts and proofs,
//! and operating the sweep lock.
//!
//! | Method | Path | |
//! |--------|------|-|
//! | POST | `/api/v1/attestations` | submit |
//! | POST | `/api/v1/attestations/{id}/confirm` | counter-commit |
//! | GET | `/api/v1/verify/{hash}` | by commitment or id |
//! | GET | `/api/v1/verify/{type}/{id}` | by target |
//! | POST | `/api/v1/verify/proof` | standalone Merkle proof |
//! | GET | `/api/v1/chains/{scope}/verify` | hash chain |
//! | POST/GET | `/internal/lock/*` | acquire, release, status (bearer token) |
//! | GET | `/health` | |

pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::api_router;
pub use server::{init_tracing, shutdown_signal, NotaryServer, ServerConfig};
pub use state::AppState;
