//! # Crash Round Server
//!
//! Authoritative, provably fair round server for the Crash betting game.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CRASH ROUND SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                                │
//! │  ├── ids.rs      - Player and round identifiers              │
//! │  ├── multiplier.rs - Hundredths fixed-point multiplier       │
//! │  └── hash.rs     - Domain-separated SHA-256                  │
//! │                                                              │
//! │  fairness/       - Commit/reveal                             │
//! │  ├── secret.rs   - Master and per-round secrets              │
//! │  ├── crash_point.rs - Crash point derivation                 │
//! │  └── commitment.rs - Commitments and reveals                 │
//! │                                                              │
//! │  game/           - Round logic (clock-free)                  │
//! │  ├── curve.rs    - Multiplier growth curve                   │
//! │  ├── ledger.rs   - Bets and rejection reasons                │
//! │  ├── round.rs    - Round, phase, history, snapshot           │
//! │  ├── machine.rs  - WAITING → RUNNING → CRASHED               │
//! │  └── events.rs   - Round events                              │
//! │                                                              │
//! │  settlement/     - Ledger collaborator                       │
//! │  ├── store.rs    - LedgerStore trait, in-memory ledger       │
//! │  └── connector.rs- Idempotent settlement with retry          │
//! │                                                              │
//! │  network/        - Clock, I/O                                │
//! │  ├── driver.rs   - Single-writer round task                  │
//! │  ├── gateway.rs  - Auth, pre-checks, fan-out                 │
//! │  ├── server.rs   - WebSocket server                          │
//! │  ├── session.rs  - Connection registry                       │
//! │  ├── protocol.rs - Message types                             │
//! │  └── auth.rs     - JWT validation                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Fairness Guarantee
//!
//! Every round's crash point is fixed by a secret committed to before the
//! round accepts bets. The secret is revealed once the round crashes, and
//! anyone can recompute the crash point from it with
//! [`fairness::generate_crash_point_with`].
//!
//! Only the driver task mutates round state. Requests carry the instant
//! they were received, so a cashout is priced at its receive time and a
//! crash that was due first always wins.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod fairness;
pub mod game;
pub mod settlement;
pub mod network;
pub mod config;

// Re-export commonly used types
pub use crate::core::ids::{PlayerId, RoundId};
pub use crate::core::multiplier::Multiplier;
pub use game::machine::{RoundConfig, RoundMachine};
pub use config::AppConfig;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
