//! Monetary conversions. Sats and USD cents are ledger units, USD micros
//! is the pricing unit (1 USD = 1_000_000 micros = 100 cents).

pub const MICROS_PER_CENT: i64 = 10_000;

/// Converts a USD amount in micros to satoshis at the given BTC/USD rate,
/// rounding up so quotes never undercharge
pub fn usd_micros_to_sats(usd_micros: i64, btc_usd: f64) -> i64 {
    (usd_micros as f64 * 100.0 / btc_usd).ceil() as i64
}

/// Converts a USD amount in cents to satoshis at the given BTC/USD rate
pub fn usd_cents_to_sats(usd_cents: i64, btc_usd: f64) -> i64 {
    usd_micros_to_sats(usd_cents * MICROS_PER_CENT, btc_usd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micros_to_sats_rounds_up() {
        // 1_000 micros at 50k USD/BTC is exactly 2 sats
        assert_eq!(usd_micros_to_sats(1_000, 50_000.0), 2);

        // at 100k USD/BTC it is exactly 1 sat
        assert_eq!(usd_micros_to_sats(1_000, 100_000.0), 1);

        // fractional results round up, never down
        assert_eq!(usd_micros_to_sats(1_000, 60_000.0), 2);

        assert_eq!(usd_micros_to_sats(1, 100_000.0), 1);
    }

    #[test]
    fn one_dollar_in_sats() {
        // 1 USD at 100k USD/BTC = 1000 sats
        assert_eq!(usd_cents_to_sats(100, 100_000.0), 1_000);
    }

    #[test]
    fn zero_is_zero() {
        assert_eq!(usd_micros_to_sats(0, 50_000.0), 0);
    }
}
