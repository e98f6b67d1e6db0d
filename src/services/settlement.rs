//! Settlement split computation.
//!
//! Pure and deterministic: storage never enters the picture, so the
//! conservation property can be tested over arbitrary amounts.

use crate::config::SettlementConfig;
use crate::models::SettlementSplit;

/// Compute the fee/commission breakdown for a released escrow amount.
///
/// Fee and commission round DOWN to the nearest minor unit; the rounding
/// remainder accrues to the seller, so the parts always sum exactly to
/// `amount_minor`.
pub fn compute_split(amount_minor: i64, has_agent: bool, rates: &SettlementConfig) -> SettlementSplit {
    debug_assert!(amount_minor > 0);

    let platform_fee = bps_floor(amount_minor, rates.platform_fee_bps);
    let agent_commission = if has_agent {
        bps_floor(amount_minor, rates.agent_commission_bps)
    } else {
        0
    };
    let seller_net = amount_minor - platform_fee - agent_commission;

    SettlementSplit {
        platform_fee,
        agent_commission,
        seller_net,
    }
}

/// `amount * bps / 10_000`, floored. Widened to i128 so amounts up to 10^12
/// minor units cannot overflow mid-multiplication.
fn bps_floor(amount_minor: i64, bps: u32) -> i64 {
    (amount_minor as i128 * bps as i128 / 10_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn rates() -> SettlementConfig {
        SettlementConfig {
            platform_fee_bps: 200,
            agent_commission_bps: 300,
            platform_destination: "platform@icici".to_string(),
        }
    }

    #[test]
    fn ten_thousand_rupees_with_agent() {
        let split = compute_split(1_000_000, true, &rates());
        assert_eq!(split.platform_fee, 20_000);
        assert_eq!(split.agent_commission, 30_000);
        assert_eq!(split.seller_net, 950_000);
        assert_eq!(split.total(), 1_000_000);
    }

    #[test]
    fn no_agent_means_zero_commission() {
        let split = compute_split(1_000_000, false, &rates());
        assert_eq!(split.agent_commission, 0);
        assert_eq!(split.seller_net, 980_000);
        assert_eq!(split.total(), 1_000_000);
    }

    #[test]
    fn rounding_remainder_goes_to_seller() {
        // 2% of 101 paise is 2.02 -> fee floors to 2, seller keeps the 0.02.
        let split = compute_split(101, false, &rates());
        assert_eq!(split.platform_fee, 2);
        assert_eq!(split.seller_net, 99);
        assert_eq!(split.total(), 101);
    }

    #[test]
    fn conserves_every_minor_unit_over_random_amounts() {
        let mut rng = rand::thread_rng();
        let rates = rates();
        for _ in 0..10_000 {
            let amount = rng.gen_range(1..=1_000_000_000_000i64);
            let has_agent = rng.gen_bool(0.5);
            let split = compute_split(amount, has_agent, &rates);
            assert!(split.platform_fee >= 0);
            assert!(split.agent_commission >= 0);
            assert!(split.seller_net >= 0);
            assert_eq!(split.total(), amount, "leaked currency at amount {amount}");
        }
    }

    #[test]
    fn smallest_amounts_never_go_negative() {
        for amount in 1..=1_000 {
            let split = compute_split(amount, true, &rates());
            assert!(split.seller_net >= 0);
            assert_eq!(split.total(), amount);
        }
    }
}
