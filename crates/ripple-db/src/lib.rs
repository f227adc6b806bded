//! Persistence layer for the reactive task subsystem.
//!
//! Everything that talks to PostgreSQL lives here: connection pooling and
//! migrations, the typed row models, validated dynamic identifiers, the
//! `Sql` fragment type used to compose compiled filter expressions into
//! statements, and the query modules for task records, the change log, the
//! leader lease, stream cursors, reconciliation state, and the metrics
//! registry.

pub mod batch;
pub mod ident;
pub mod models;
pub mod pool;
pub mod queries;
pub mod sql;
pub mod tx;
