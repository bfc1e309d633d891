//! Client metrics.
//!
//! Recorded through the `metrics` facade. Nothing is exported unless the
//! embedding application installs a recorder.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const FRAMES_TOTAL: &str = "tether_frames_total";
    pub const FRAME_BYTES: &str = "tether_frame_bytes";
    pub const RECONNECTS_TOTAL: &str = "tether_reconnects_total";
    pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "tether_heartbeat_timeouts_total";
    pub const CHANNEL_JOINS_TOTAL: &str = "tether_channel_joins_total";
    pub const DECODE_ERRORS_TOTAL: &str = "tether_decode_errors_total";
    pub const CHANNELS_ACTIVE: &str = "tether_channels_active";
}

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames sent and received");
    metrics::describe_counter!(names::FRAME_BYTES, "Total bytes of frames sent and received");
    metrics::describe_counter!(
        names::RECONNECTS_TOTAL,
        "Total number of scheduled reconnect attempts"
    );
    metrics::describe_counter!(
        names::HEARTBEAT_TIMEOUTS_TOTAL,
        "Connections closed because a heartbeat went unanswered"
    );
    metrics::describe_counter!(
        names::CHANNEL_JOINS_TOTAL,
        "Channel join replies by status"
    );
    metrics::describe_counter!(names::DECODE_ERRORS_TOTAL, "Inbound frames that failed to decode");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Channels registered with the socket");
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAME_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a scheduled reconnect.
pub fn record_reconnect() {
    counter!(names::RECONNECTS_TOTAL).increment(1);
}

/// Record a heartbeat timeout.
pub fn record_heartbeat_timeout() {
    counter!(names::HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
}

/// Record a join reply.
pub fn record_join(status: &str) {
    counter!(names::CHANNEL_JOINS_TOTAL, "status" => status.to_string()).increment(1);
}

/// Record a frame that failed to decode.
pub fn record_decode_error() {
    counter!(names::DECODE_ERRORS_TOTAL).increment(1);
}

/// Record a channel registration.
pub fn record_channel_added() {
    gauge!(names::CHANNELS_ACTIVE).increment(1.0);
}

/// Record a channel removal.
pub fn record_channel_removed() {
    gauge!(names::CHANNELS_ACTIVE).decrement(1.0);
}
