// SPDX-License-Identifier: Apache-2.0

//! Log harvesting engine: file discovery, identity, per-file harvesters,
//! the spooler between harvesters and the publisher, and the registry of
//! durable read offsets.

pub mod claims;
pub mod committer;
pub mod config;
pub mod error;
pub mod finder;
pub mod harvester;
pub mod identity;
pub mod offset_tracker;
pub mod prospector;
pub mod reader;
pub mod record;
pub mod registry;
pub mod spooler;

pub use committer::{Acknowledger, OffsetCommitter, ack_channel};
pub use config::{HarvestConfig, StartAt};
pub use error::{Error, Result};
pub use harvester::{HarvestOutcome, Harvester, HarvesterState};
pub use identity::{FileIdentity, FileKey, Fingerprint, IdentityResolver};
pub use prospector::Prospector;
pub use record::{ByteRange, Record};
pub use registry::{EntryState, Registry, RegistryEntry};
pub use spooler::{SpoolDrain, Spooler};
