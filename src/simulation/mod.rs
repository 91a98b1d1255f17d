pub mod profit;

pub use profit::{simulate_investment_and_profit, strategy_balance, ProfitReport};
