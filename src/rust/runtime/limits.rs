// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Number of threads created per locality at init. The first one becomes the handler.
pub const DEFAULT_IDLE_THREADS: usize = 1;

/// How long a handler sleeps on an empty run queue before re-checking its locality. This is a liveness fallback, not a
/// scheduling decision.
pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 100;

/// Upper bound on the number of localities a domain accepts.
pub const MAX_LOCALITIES: usize = 1024;

/// Opcode reserved for the generic error reply.
pub const GENERIC_ERROR_REPLY_OPCODE: u32 = u32::MAX;

/// Capacity of the telemetry channel created by [crate::reqh::services::ChannelTelemetry::bounded] callers that do not
/// specify one.
pub const TELEMETRY_QUEUE_DEPTH: usize = 4096;

/// Histogram parameters for state dwell times, in nanoseconds.
pub const STATS_GROUPING_POWER: u8 = 7;
pub const STATS_MAX_VALUE_POWER: u8 = 64;
