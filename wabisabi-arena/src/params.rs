//! Per-round parameters.

use bitcoin::ScriptBuf;
use serde::Serialize;
use tracing::warn;

use wabisabi_core::{
    Coin, CoordinationFeeRate, ScriptType, WabiSabiConfig, P2TR_OUTPUT_VSIZE, TX_SKELETON_VSIZE,
};

/// Parameters fixed when a round is created.
///
/// Counts, amounts and fees are captured here. Phase timeouts are not: they
/// are read from the live config on every tick.
#[derive(Clone, Debug, Serialize)]
pub struct RoundParameters {
    pub max_input_count: usize,
    pub min_input_count: usize,
    pub max_inputs_per_alice: usize,
    pub min_amount: u64,
    pub max_amount: u64,
    pub max_weight_per_alice: u64,
    pub mining_fee_rate: u64,
    pub coordination_fee_rate: CoordinationFeeRate,
    pub allowed_input_types: Vec<ScriptType>,
    pub allowed_output_types: Vec<ScriptType>,
    #[serde(skip)]
    pub coordinator_script: Option<ScriptBuf>,
}

impl RoundParameters {
    pub fn from_config(config: &WabiSabiConfig) -> Self {
        let coordinator_script = config.coordinator_script().unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring unparsable coordinator script");
            None
        });

        Self {
            max_input_count: config.max_input_count_by_round,
            min_input_count: config.min_input_count_by_round(),
            max_inputs_per_alice: config.max_inputs_per_alice,
            min_amount: config.min_registrable_amount_sats,
            max_amount: config.max_registrable_amount_sats,
            max_weight_per_alice: config.max_weight_allocation_per_alice(),
            mining_fee_rate: config.mining_fee_rate_sat_per_vb,
            coordination_fee_rate: config.coordination_fee_rate.clone(),
            allowed_input_types: config.allowed_input_types.clone(),
            allowed_output_types: config.allowed_output_types.clone(),
            coordinator_script,
        }
    }

    /// Parameters of a blame round seeded with `seeded` inputs.
    pub fn for_blame_round(&self, seeded: usize) -> Self {
        Self {
            max_input_count: seeded,
            min_input_count: self.min_input_count.min(seeded).max(1),
            ..self.clone()
        }
    }

    pub fn input_fee(&self, coin: &Coin) -> u64 {
        coin.input_vsize().unwrap_or(0) * self.mining_fee_rate
    }

    pub fn output_fee(&self, script_type: ScriptType) -> u64 {
        script_type.output_vsize() * self.mining_fee_rate
    }

    /// Value of the amount credential for a set of inputs, net of fees.
    pub fn net_amount(&self, coins: &[Coin]) -> u64 {
        let total: u64 = coins.iter().map(|c| c.amount().to_sat()).sum();
        let mining: u64 = coins.iter().map(|c| self.input_fee(c)).sum();
        let coordination = self.coordination_fee_rate.fee_for(total);
        total.saturating_sub(mining).saturating_sub(coordination)
    }

    pub fn input_weight(&self, coins: &[Coin]) -> u64 {
        coins.iter().map(|c| c.input_weight().unwrap_or(0)).sum()
    }

    /// Value of the weight credential for a set of inputs.
    pub fn weight_allowance(&self, coins: &[Coin]) -> u64 {
        self.max_weight_per_alice.saturating_sub(self.input_weight(coins))
    }

    /// Smallest amount credential balance that can still fund an output.
    pub fn min_output_cost(&self) -> u64 {
        let cheapest = self
            .allowed_output_types
            .iter()
            .map(|t| self.output_fee(*t))
            .min()
            .unwrap_or(0);
        self.min_amount + cheapest
    }

    /// Mining fee for the parts of the coinjoin nobody's credentials pay for.
    pub fn shared_fee(&self) -> u64 {
        let coordinator_vsize = self
            .coordinator_script
            .as_ref()
            .and_then(|s| ScriptType::from_script(s))
            .map(|t| t.output_vsize())
            .unwrap_or(P2TR_OUTPUT_VSIZE);
        (TX_SKELETON_VSIZE + coordinator_vsize) * self.mining_fee_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wabisabi_core::testing::coin;
    use test_case::test_case;
    use wabisabi_core::COIN_SATS;

    #[test]
    fn test_net_amount_deducts_fees() {
        let params = RoundParameters::from_config(&WabiSabiConfig::default());
        let small = coin(1, 100_000);
        // 68 vB at 2 sat/vB, below the coordination fee threshold
        assert_eq!(params.net_amount(&[small]), 100_000 - 136);

        let large = coin(2, COIN_SATS);
        assert_eq!(params.net_amount(&[large]), COIN_SATS - 136 - 300_000);
    }

    #[test]
    fn test_weight_allowance() {
        let params = RoundParameters::from_config(&WabiSabiConfig::default());
        assert_eq!(params.weight_allowance(&[coin(1, 10_000)]), 255 * 4 - 272);
    }

    #[test_case(7, 7 ; "smaller than minimum")]
    #[test_case(60, 50 ; "keeps minimum")]
    #[test_case(0, 1 ; "never zero")]
    fn test_blame_parameters(seeded: usize, expected_min: usize) {
        let params = RoundParameters::from_config(&WabiSabiConfig::default());
        let blame = params.for_blame_round(seeded);
        assert_eq!(blame.max_input_count, seeded);
        assert_eq!(blame.min_input_count, expected_min);
    }
}
