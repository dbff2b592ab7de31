//! Horizontal bar chart rendered into terminal cells.
//!
//! Categories run down the vertical axis and the value axis sits on top,
//! so the chart reads like a ranked list.

/// Point on the chart in cell coordinates, column then row, origin top-left.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Title line, tick labels and axis line above the first bar.
const HEADER_ROWS: usize = 3;

const EIGHTHS: [char; 8] = [' ', '▏', '▎', '▍', '▌', '▋', '▊', '▉'];

#[derive(Clone, Debug)]
pub struct ChartConfig {
    /// Dataset legend shown on the title row.
    pub title: String,
    /// Columns reserved for category labels.
    pub label_width: usize,
    /// Columns spanned by the value axis.
    pub bar_width: usize,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            title: "Pick the next token".to_string(),
            label_width: 16,
            bar_width: 48,
        }
    }
}

pub struct BarChart {
    config: ChartConfig,
    labels: Vec<String>,
    values: Vec<f32>,
}

fn display_label(label: &str, width: usize) -> String {
    let mut cells: Vec<char> = Vec::with_capacity(label.len());
    for ch in label.chars() {
        match ch {
            '\n' => cells.extend(['\\', 'n']),
            '\t' => cells.extend(['\\', 't']),
            '\r' => cells.extend(['\\', 'r']),
            c if c.is_control() => cells.extend(c.escape_unicode()),
            c => cells.push(c),
        }
    }
    if cells.len() > width {
        cells.truncate(width.saturating_sub(1));
        cells.push('…');
    }
    let text: String = cells.into_iter().collect();
    format!("{text:>width$}")
}

impl BarChart {
    pub fn new(config: ChartConfig) -> Self {
        Self { config, labels: Vec::new(), values: Vec::new() }
    }

    /// A chart whose categories are `seeds`, each at full value.
    pub fn with_seeds(config: ChartConfig, seeds: &[String]) -> Self {
        let mut chart = Self::new(config);
        chart.update(seeds.to_vec(), vec![1.0; seeds.len()]);
        chart
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// Replaces both arrays; missing values are treated as zero.
    pub fn update(&mut self, labels: Vec<String>, mut values: Vec<f32>) {
        values.resize(labels.len(), 0.0);
        self.labels = labels;
        self.values = values;
    }

    fn plot_left(&self) -> f64 {
        // label column plus the " |" separator
        (self.config.label_width + 2) as f64
    }

    fn plot_right(&self) -> f64 {
        self.plot_left() + self.config.bar_width as f64
    }

    fn plot_top(&self) -> f64 {
        HEADER_ROWS as f64
    }

    fn plot_bottom(&self) -> f64 {
        (HEADER_ROWS + self.labels.len()) as f64
    }

    fn in_plot_area(&self, pos: Position) -> bool {
        pos.x >= self.plot_left()
            && pos.x <= self.plot_right()
            && pos.y >= self.plot_top()
            && pos.y <= self.plot_bottom()
    }

    /// Centre of the bar for category `index`.
    pub fn bar_center(&self, index: usize) -> Option<Position> {
        (index < self.labels.len()).then(|| {
            Position::new(
                (self.plot_left() + self.plot_right()) / 2.0,
                self.plot_top() + index as f64 + 0.5,
            )
        })
    }

    /// Nearest category along the vertical axis, without requiring the
    /// point to touch the bar itself.
    pub fn element_at(&self, pos: Position) -> Option<usize> {
        if self.labels.is_empty() || !self.in_plot_area(pos) {
            return None;
        }
        let mut best: Option<(usize, f64)> = None;
        for index in 0..self.labels.len() {
            let center = self.plot_top() + index as f64 + 0.5;
            let distance = (pos.y - center).abs();
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((index, distance));
            }
        }
        best.map(|(index, _)| index)
    }

    fn scale_max(&self) -> f32 {
        let max = self.values.iter().cloned().fold(0.0_f32, f32::max);
        if max > 0.0 {
            max
        } else {
            1.0
        }
    }

    fn bar(&self, value: f32) -> String {
        let width = self.config.bar_width;
        let eighths = ((value.max(0.0) / self.scale_max()) * (width * 8) as f32).round() as usize;
        let eighths = eighths.min(width * 8);
        let mut bar = "█".repeat(eighths / 8);
        if eighths % 8 != 0 {
            bar.push(EIGHTHS[eighths % 8]);
        }
        bar
    }

    /// Draws the whole chart.
    pub fn redraw(&self) -> String {
        let label_width = self.config.label_width;
        let bar_width = self.config.bar_width;
        let max = self.scale_max();
        let pad = " ".repeat(label_width + 2);

        let mut out = String::new();
        out.push_str(&format!("{pad}{}\n", self.config.title));

        let low = "0";
        let mid = format!("{:.3}", max / 2.0);
        let high = format!("{max:.3}");
        let mut ticks = vec![' '; bar_width + high.len()];
        for (col, text) in [(0, low), (bar_width / 2, mid.as_str()), (bar_width, high.as_str())] {
            for (i, ch) in text.chars().enumerate() {
                if let Some(cell) = ticks.get_mut(col + i) {
                    *cell = ch;
                }
            }
        }
        out.push_str(&format!("{pad}{}\n", ticks.into_iter().collect::<String>().trim_end()));

        let mut axis: Vec<char> = vec!['-'; bar_width + 1];
        for col in [0, bar_width / 2, bar_width] {
            axis[col] = '+';
        }
        out.push_str(&format!("{pad}{}\n", axis.into_iter().collect::<String>()));

        for (label, &value) in self.labels.iter().zip(&self.values) {
            out.push_str(&format!(
                "{} |{} {value:.4}\n",
                display_label(label, label_width),
                self.bar(value)
            ));
        }
        out
    }
}
