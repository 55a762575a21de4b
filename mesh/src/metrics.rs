//! Metric names and recording helpers.
//!
//! Uses the `metrics` facade; nothing is exported unless the host process
//! installs a recorder.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

pub const CONNECTIONS_ACTIVE: &str = "mesh_connections_active";
pub const CONNECTIONS_ESTABLISHED_TOTAL: &str = "mesh_connections_established_total";
pub const CONNECTION_FAILURES_TOTAL: &str = "mesh_connection_failures_total";
pub const CONNECTION_RTT: &str = "mesh_connection_rtt_microseconds";
pub const TRANSITIONS_TOTAL: &str = "mesh_membership_transitions_total";
pub const MESH_NODES: &str = "mesh_nodes";
pub const DELTAS_APPLIED_TOTAL: &str = "mesh_directory_deltas_applied_total";

pub fn describe() {
    describe_gauge!(CONNECTIONS_ACTIVE, "Connections currently in the connected state");
    describe_counter!(
        CONNECTIONS_ESTABLISHED_TOTAL,
        "Connections that completed their handshake"
    );
    describe_counter!(
        CONNECTION_FAILURES_TOTAL,
        "Connections that failed to establish or were lost"
    );
    describe_histogram!(CONNECTION_RTT, "Keepalive round-trip time in microseconds");
    describe_counter!(
        TRANSITIONS_TOTAL,
        "Membership operations by operation and result"
    );
    describe_gauge!(MESH_NODES, "Members in the local roster");
    describe_counter!(
        DELTAS_APPLIED_TOTAL,
        "Replicated directory changes applied locally"
    );
}

pub fn connection_established(direction: &'static str) {
    counter!(CONNECTIONS_ESTABLISHED_TOTAL, "direction" => direction).increment(1);
}

pub fn connection_failed(reason: &'static str) {
    counter!(CONNECTION_FAILURES_TOTAL, "reason" => reason).increment(1);
}

pub fn set_active_connections(count: usize) {
    gauge!(CONNECTIONS_ACTIVE).set(count as f64);
}

pub fn record_rtt(rtt: Duration) {
    histogram!(CONNECTION_RTT).record(rtt.as_micros() as f64);
}

pub fn transition(op: &'static str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!(TRANSITIONS_TOTAL, "op" => op, "result" => result).increment(1);
}

pub fn set_mesh_nodes(count: usize) {
    gauge!(MESH_NODES).set(count as f64);
}

pub fn delta_applied(kind: &'static str) {
    counter!(DELTAS_APPLIED_TOTAL, "kind" => kind).increment(1);
}
