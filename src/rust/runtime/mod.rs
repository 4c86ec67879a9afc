// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod chan;
pub mod fail;
pub mod limits;
pub mod logging;
pub mod sm;
pub mod stats;
pub mod timer;

pub use self::{
    chan::{
        Chan,
        Clink,
    },
    fail::Fail,
    sm::{
        SmState,
        StateMachine,
    },
    stats::SmStats,
};
