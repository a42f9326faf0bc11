//! Wire protocol for the Rock Pi Wi-Fi provisioning BLE service.
//!
//! This crate holds only protocol constants and framing: GATT UUIDs,
//! `C_STATUS`/`C_CONTROL` byte layouts, and the `C_CREDENTIALS` envelope plus
//! the JSON payload it carries. Domain logic (the state machine, crypto,
//! validation) lives in `provision-core` and friends; this crate has no
//! knowledge of them so it can be shared by both the daemon and any future
//! standalone client tooling.

pub mod ble;
pub mod credentials;

pub use ble::{control, state_code};
pub use credentials::{CredentialFrame, CredentialMessage, DeviceInfo, FrameError, SecurityType};
