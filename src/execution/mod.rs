// Tick evaluation, order submission and trade commits
pub mod coordinator;

pub use coordinator::{
    decide_action, CoordinatorOptions, SymbolPlan, SymbolSnapshot, TickAction, TradeCoordinator,
    TradeReport,
};
