pub mod averages;
pub mod core;
pub mod publish;
pub mod reports;
pub mod roster;
pub mod scores;
pub mod years;
