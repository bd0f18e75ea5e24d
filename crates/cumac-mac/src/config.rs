//! MAC parameters and derived frame timings.

use cumac_common::SimTime;
use cumac_modem::{calculate_tx_time, DEFAULT_DATA_RATE_BPS, DEFAULT_NUM_CHANNELS};
use cumac_packet::{
    CtsHeader, RtsHeader, BEACON_EXTENDED_SIZE, COMMON_HEADER_SIZE, DATA_HEADER_SIZE,
};

use crate::busy_signal::ToneTiming;
use crate::channel_manager::DEFAULT_PRUNE_MARGIN;

pub const DEFAULT_CW_MIN: u32 = 2;
pub const DEFAULT_CW_MAX: u32 = 5;
pub const DEFAULT_SLOT_TIME: SimTime = SimTime::from_micros(200_000);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RTS_CHANNEL_COUNT: usize = 3;
pub const DEFAULT_POLL_COUNT: u32 = 5;
pub const DEFAULT_MAX_SIGNAL_INTERVAL: u8 = 11;
pub const DEFAULT_DATA_GUARD: SimTime = SimTime::from_micros(100_000);

#[derive(Debug, Clone, PartialEq)]
pub struct MacConfig {
    /// Channel 0 carries control traffic, 1.. carry data.
    pub num_channels: u8,
    pub data_rate_bps: u32,
    /// Contention window exponents: a backoff draws `0..=2^cw` slots.
    pub cw_min: u32,
    pub cw_max: u32,
    pub slot_time: SimTime,
    /// Retransmissions after the first RTS before a frame is dropped.
    pub max_retries: u32,
    /// Data channels proposed per RTS.
    pub rts_channel_count: usize,
    pub prune_margin: SimTime,
    pub tone_timing: ToneTiming,
    /// Busy-tone polls per beacon.
    pub poll_count: u32,
    pub max_signal_interval: u8,
    /// Slack added to the data wait after sending a CTS.
    pub data_guard: SimTime,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            num_channels: DEFAULT_NUM_CHANNELS,
            data_rate_bps: DEFAULT_DATA_RATE_BPS,
            cw_min: DEFAULT_CW_MIN,
            cw_max: DEFAULT_CW_MAX,
            slot_time: DEFAULT_SLOT_TIME,
            max_retries: DEFAULT_MAX_RETRIES,
            rts_channel_count: DEFAULT_RTS_CHANNEL_COUNT,
            prune_margin: DEFAULT_PRUNE_MARGIN,
            tone_timing: ToneTiming::DEFAULT,
            poll_count: DEFAULT_POLL_COUNT,
            max_signal_interval: DEFAULT_MAX_SIGNAL_INTERVAL,
            data_guard: DEFAULT_DATA_GUARD,
        }
    }
}

impl MacConfig {
    pub fn tx_time(&self, bytes: usize) -> SimTime {
        calculate_tx_time(self.data_rate_bps, bytes)
    }

    pub fn rts_tx(&self) -> SimTime {
        self.tx_time(COMMON_HEADER_SIZE + RtsHeader::SIZE)
    }

    /// Airtime of an extended beacon.
    pub fn beacon_tx(&self) -> SimTime {
        self.tx_time(COMMON_HEADER_SIZE + BEACON_EXTENDED_SIZE)
    }

    pub fn cts_tx(&self) -> SimTime {
        self.tx_time(COMMON_HEADER_SIZE + CtsHeader::SIZE)
    }

    /// Airtime of a data frame carrying `payload_len` bytes.
    pub fn data_tx(&self, payload_len: usize) -> SimTime {
        self.tx_time(COMMON_HEADER_SIZE + DATA_HEADER_SIZE + payload_len)
    }

    pub fn tone_interval(&self, signal_interval: u8) -> SimTime {
        self.tone_timing.interval(signal_interval)
    }

    /// Time spent polling for busy tones after a beacon with `signal_interval`.
    pub fn poll_window(&self, signal_interval: u8) -> SimTime {
        self.tone_interval(signal_interval)
            .mul(self.poll_count.saturating_sub(1) as u64)
    }

    pub fn max_poll_window(&self) -> SimTime {
        self.poll_window(self.max_signal_interval)
    }

    /// Data channels usable for reservations.
    pub fn data_channels(&self) -> impl Iterator<Item = u8> {
        1..self.num_channels
    }

    pub fn is_data_channel(&self, channel: u8) -> bool {
        channel != 0 && channel < self.num_channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_airtimes() {
        let config = MacConfig::default();
        assert_eq!(config.rts_tx(), SimTime::from_millis(160));
        assert_eq!(config.beacon_tx(), SimTime::from_millis(152));
        assert_eq!(config.cts_tx(), SimTime::from_millis(152));
        assert_eq!(config.data_tx(20), SimTime::from_millis(192));
    }

    #[test]
    fn test_poll_window() {
        let config = MacConfig::default();
        assert_eq!(config.poll_window(0), SimTime::from_millis(800));
        assert_eq!(config.max_poll_window(), SimTime::from_millis(1240));
    }

    #[test]
    fn test_data_channels() {
        let config = MacConfig::default();
        assert_eq!(config.data_channels().collect::<Vec<_>>(), (1..9).collect::<Vec<_>>());
        assert!(!config.is_data_channel(0));
        assert!(!config.is_data_channel(9));
    }
}
