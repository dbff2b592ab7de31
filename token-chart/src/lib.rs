//! Terminal next-token explorer: a clickable bar chart of the most likely
//! next tokens, extended one pick at a time.

pub mod app;
pub mod chart;
pub mod controller;

pub use chart::{BarChart, ChartConfig, Position};
pub use controller::{ChartController, Completion, Phase, PredictionRequest};
