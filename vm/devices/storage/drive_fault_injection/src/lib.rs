// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fault injection for drive commands.
//!
//! Two fault sources are provided. A [`FaultStore`] marks individual blocks
//! of one drive as failing; any access to them reports the fault until the
//! block is reassigned or cleared. An [`InjectionEngine`] holds records that
//! match commands by drive, opcode and range, and fire a bounded number of
//! times. The [`Interceptor`] consults both on the outbound path and
//! completes matching commands with the error a real drive would return.

#![forbid(unsafe_code)]

pub mod clock;
pub mod engine;
pub mod interceptor;
pub mod store;

pub use engine::EngineConfig;
pub use engine::EngineError;
pub use engine::InjectedError;
pub use engine::InjectionEngine;
pub use engine::InjectionRecord;
pub use engine::RecordHandle;
pub use engine::TargetId;
pub use interceptor::FisRequest;
pub use interceptor::Intercept;
pub use interceptor::Interceptor;
pub use interceptor::ScsiRequest;
pub use interceptor::ShortenedWrite;
pub use store::FaultKind;
pub use store::FaultStore;
pub use store::KindFilter;
pub use store::StoreConfig;
pub use store::StoreError;
