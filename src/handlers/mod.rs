pub mod balance_changes;
