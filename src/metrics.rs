//! eventline runtime metrics.
//!
//! Process-wide counters for connection lifecycle, byte throughput, and
//! loop activity. Exposed through the `metriken` registry; the crate never
//! installs an exporter itself.

use metriken::{metric, Counter, Gauge};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "eventline/connections/accepted",
    description = "Total inbound connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "eventline/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "eventline/connections/active",
    description = "Currently established connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "eventline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "eventline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Loop activity ────────────────────────────────────────────────

#[metric(
    name = "eventline/loop/wakeups",
    description = "Cross-thread wakeups delivered to event loops"
)]
pub static LOOP_WAKEUPS: Counter = Counter::new();

#[metric(
    name = "eventline/timers/fired",
    description = "Timer callbacks fired"
)]
pub static TIMERS_FIRED: Counter = Counter::new();

#[metric(
    name = "eventline/connector/retries",
    description = "Outbound connect attempts scheduled for retry"
)]
pub static CONNECT_RETRIES: Counter = Counter::new();
