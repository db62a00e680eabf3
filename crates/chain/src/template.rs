use walletd_primitives::{Address, Asset, OutputId};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputSpec {
    pub address: Address,
    pub asset: Asset,
    pub value: u64,
}

#[derive(Clone, Debug, Default)]
pub struct TransactionTemplate {
    pub spent: Vec<OutputId>,
    pub outputs: Vec<OutputSpec>,
}

impl TransactionTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spend(mut self, output: OutputId) -> Self {
        self.spent.push(output);
        self
    }

    pub fn pay(mut self, address: Address, value: u64) -> Self {
        self.outputs.push(OutputSpec {
            address,
            asset: Asset::Primary,
            value,
        });
        self
    }

    pub fn pay_secondary(mut self, address: Address, value: u64) -> Self {
        self.outputs.push(OutputSpec {
            address,
            asset: Asset::Secondary,
            value,
        });
        self
    }
}

/// Contents of a block before the engine assigns ids and maturity heights.
#[derive(Clone, Debug, Default)]
pub struct BlockTemplate {
    /// Unix seconds; defaults to parent timestamp + 1.
    pub timestamp: Option<u64>,
    pub payouts: Vec<OutputSpec>,
    pub transactions: Vec<TransactionTemplate>,
}

impl BlockTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn payout(mut self, address: Address, value: u64) -> Self {
        self.payouts.push(OutputSpec {
            address,
            asset: Asset::Primary,
            value,
        });
        self
    }

    pub fn transaction(mut self, transaction: TransactionTemplate) -> Self {
        self.transactions.push(transaction);
        self
    }
}
