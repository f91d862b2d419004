// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{info, warn};

/// Default priority of the merge thread when SONISYNC_THREAD_PRIORITY is unset.
const DEFAULT_MERGE_THREAD_PRIORITY: u8 = 70;

fn parse_priority(value: Option<String>) -> Option<ThreadPriorityValue> {
    let n = value?.parse::<u8>().ok()?;
    (n < 100).then(|| ThreadPriorityValue::try_from(n).ok())?
}

/// Reads SONISYNC_THREAD_PRIORITY (0-99).
pub fn merge_thread_priority() -> Option<ThreadPriorityValue> {
    parse_priority(std::env::var("SONISYNC_THREAD_PRIORITY").ok())
        .or_else(|| ThreadPriorityValue::try_from(DEFAULT_MERGE_THREAD_PRIORITY).ok())
}

pub(crate) fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| {
            v == "1"
                || v.eq_ignore_ascii_case("true")
                || v.eq_ignore_ascii_case("yes")
                || v.eq_ignore_ascii_case("on")
        })
        .unwrap_or(false)
}

/// Returns whether we should attempt RT (SCHED_FIFO) scheduling for the merge thread.
/// Opt out with SONISYNC_DISABLE_RT=1.
pub fn rt_enabled() -> bool {
    !env_flag("SONISYNC_DISABLE_RT")
}

/// Raises the priority of the calling thread, the merge/dispatch worker. Failures only warn:
/// pacing still works at normal priority, with more late ticks.
pub fn configure_merge_thread() {
    let Some(priority) = merge_thread_priority() else {
        return;
    };
    let tp = ThreadPriority::Crossplatform(priority);
    if let Err(e) = set_current_thread_priority(tp) {
        warn!(error = ?e, "Failed to raise merge thread priority");
    }

    #[cfg(unix)]
    if rt_enabled() {
        use thread_priority::unix::{
            set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
            ThreadSchedulePolicy,
        };
        match set_thread_priority_and_policy(
            thread_native_id(),
            tp,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        ) {
            Ok(()) => info!("Enabled RT SCHED_FIFO for merge thread"),
            Err(e) => warn!(error = ?e, "Failed to set RT SCHED_FIFO for merge thread"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_priority() {
        assert!(parse_priority(Some("42".into())).is_some());
        assert!(parse_priority(Some("100".into())).is_none());
        assert!(parse_priority(Some("high".into())).is_none());
        assert!(parse_priority(None).is_none());
    }
}
