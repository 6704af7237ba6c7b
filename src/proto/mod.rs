// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Binary protocol engine: wire codec, per-connection state machine,
//! reply-header pool, and UDP framing.

pub mod machine;
pub mod reply;
pub mod udp;
pub mod wire;

pub use machine::{drive, Drive};
pub use wire::Status;
