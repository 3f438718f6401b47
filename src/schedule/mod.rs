// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Job scheduling
//!
//! Turns expanded configurations into job decisions and hands the jobs that
//! must run to a backend in dependency order.

mod command;
mod options;
mod record;
mod scheduler;

pub use command::{argument_text, render_command, shell_quote};
pub use options::merge_execution_options;
pub use record::{
    atomic_write_bytes, write_invoke_script, write_links, JobRecord, LineageEntry, INVOKE_FNAME,
    JOB_RECORD_FNAME,
};
pub use scheduler::{JobStatus, PlannedJob, ScheduleOptions, SchedulePlan, Scheduler};
