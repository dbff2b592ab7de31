use std::sync::Arc;

use next_token::{Error, Predictor, Result, TokenProbability};
use tracing::{debug, info};

use crate::chart::{BarChart, Position};

/// Whole-session lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Loading,
    Ready,
    Predicting,
}

/// A prediction the caller must run and hand back through [`ChartController::complete`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PredictionRequest {
    pub seq: u64,
    pub text: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The result was the latest request and is now on the chart.
    Applied,
    /// A newer request was issued meanwhile; the result was dropped.
    Stale,
}

/// Owns the chart and the accumulated output text.
///
/// Every issued request carries a sequence number and only the most
/// recent one may update the chart, so overlapping predictions that
/// finish out of order never show an outdated distribution.
pub struct ChartController {
    chart: BarChart,
    output: String,
    predictor: Option<Arc<Predictor>>,
    phase: Phase,
    issued: u64,
}

impl ChartController {
    pub fn new(chart: BarChart) -> Self {
        Self {
            chart,
            output: String::new(),
            predictor: None,
            phase: Phase::Uninitialized,
            issued: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn chart(&self) -> &BarChart {
        &self.chart
    }

    pub fn begin_loading(&mut self) {
        self.phase = Phase::Loading;
    }

    /// Installs the loaded predictor. There is no way back to `Loading`.
    pub fn ready(&mut self, predictor: Predictor) {
        info!(top_k = predictor.top_k(), "predictor ready");
        self.predictor = Some(Arc::new(predictor));
        self.phase = Phase::Ready;
    }

    pub fn predictor(&self) -> Result<Arc<Predictor>> {
        self.predictor.clone().ok_or(Error::NotReady)
    }

    fn issue(&mut self) -> PredictionRequest {
        self.issued += 1;
        self.phase = Phase::Predicting;
        debug!(seq = self.issued, "issuing prediction");
        PredictionRequest { seq: self.issued, text: self.output.clone() }
    }

    /// Start button: replaces the output text and predicts from it.
    pub fn start(&mut self, text: &str) -> Result<PredictionRequest> {
        self.predictor()?;
        self.output = text.to_string();
        Ok(self.issue())
    }

    /// Appends the label of the bar nearest to `pos` and predicts again.
    /// A click that hits no bar changes nothing.
    pub fn on_bar_clicked(&mut self, pos: Position) -> Result<Option<PredictionRequest>> {
        self.predictor()?;
        let Some(index) = self.chart.element_at(pos) else {
            debug!(x = pos.x, y = pos.y, "click missed every bar");
            return Ok(None);
        };
        let Some(label) = self.chart.label(index) else {
            return Ok(None);
        };
        debug!(index, label, "bar clicked");
        self.output.push_str(label);
        Ok(Some(self.issue()))
    }

    /// Applies the result of request `seq` if it is still the latest one.
    pub fn complete(&mut self, seq: u64, result: Result<Vec<TokenProbability>>) -> Result<Completion> {
        if seq != self.issued {
            debug!(seq, latest = self.issued, "dropping stale prediction");
            return Ok(Completion::Stale);
        }
        self.phase = Phase::Ready;
        let ranked = result?;
        self.render(&ranked);
        Ok(Completion::Applied)
    }

    /// Runs `request` on the current thread and applies it.
    pub fn predict_now(&mut self, request: &PredictionRequest) -> Result<Completion> {
        let result = self.predictor()?.predict(&request.text);
        self.complete(request.seq, result)
    }

    /// Replaces the chart data with `ranked`, last write wins.
    pub fn render(&mut self, ranked: &[TokenProbability]) {
        let labels = ranked.iter().map(|t| t.text.clone()).collect();
        let values = ranked.iter().map(|t| t.probability).collect();
        self.chart.update(labels, values);
    }
}
