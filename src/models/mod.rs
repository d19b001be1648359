// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Data models for the local projection of the practice-management system.

pub mod client;
pub mod practitioner;
pub mod session;
pub mod slot;
pub mod sync;

pub use client::{Client, ClientRecord};
pub use practitioner::{Practitioner, PractitionerRecord, PractitionerRef};
pub use session::{Session, SessionRecord, SessionStatus};
pub use slot::{AvailabilitySlot, SlotRecord};
pub use sync::{EntityType, SyncError, SyncResult, UpsertOutcome};
