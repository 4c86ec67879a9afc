// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Locality-based scheduler for file operation machines (foms).
//!
//! Every request accepted by a [reqh::RequestHandler] becomes a fom: an explicit two-level state machine that is
//! advanced by the handler thread of one locality. A locality owns a run queue, a wait queue, a group lock and an
//! elastic pool of OS threads. Foms that must perform a genuinely blocking call bracket it with block-enter and
//! block-leave so that the locality keeps a handler running other foms throughout.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod fom;
pub mod reqh;
pub mod runtime;

pub use self::{
    fom::{
        domain::FomDomain,
        generic::Phase,
        locality::LocalityStats,
        Fom,
        FomCore,
        FomId,
        FomOps,
        FomState,
        Outcome,
        Step,
    },
    reqh::{
        config::{
            Config,
            DomainConfig,
            OverflowPolicy,
        },
        RequestHandler,
    },
    runtime::fail::Fail,
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equal, bailing out with an [anyhow::Error] otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => ({
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    anyhow::bail!(
                        "ensure failed: `(left == right)` left: `{:?}`, right: `{:?}` at {}:{}",
                        left_val,
                        right_val,
                        file!(),
                        line!()
                    );
                }
            }
        }
    });
}

/// Ensures that two expressions are not equal, bailing out with an [anyhow::Error] otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr) => ({
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    anyhow::bail!(
                        "ensure failed: `(left != right)` left: `{:?}`, right: `{:?}` at {}:{}",
                        left_val,
                        right_val,
                        file!(),
                        line!()
                    );
                }
            }
        }
    });
}
