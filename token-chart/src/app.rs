//! Interactive terminal front-end.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use next_token::{Error, LoadProgress, ModelLoader, Predictor, ProgressEvent, TokenProbability};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::chart::Position;
use crate::controller::{ChartController, Completion, PredictionRequest};

/// One line typed at the prompt.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Replace the output with this text and predict.
    Start(String),
    /// Click the chart at a cell position.
    Click(Position),
    /// Click the centre of the n-th bar (0-based).
    Pick(usize),
    Show,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (word, rest) = match line.trim_start().split_once(' ') {
            Some((word, rest)) => (word, rest),
            None => (line.trim(), ""),
        };
        match word {
            // the seed text is taken verbatim, trailing spaces included
            "start" | "s" => Ok(Command::Start(rest.to_string())),
            "click" | "c" => {
                let coords: Vec<&str> = rest.split_whitespace().collect();
                let [x, y] = coords.as_slice() else {
                    return Err("usage: click <x> <y>".to_string());
                };
                let x = x.parse().map_err(|_| format!("bad x coordinate '{x}'"))?;
                let y = y.parse().map_err(|_| format!("bad y coordinate '{y}'"))?;
                Ok(Command::Click(Position::new(x, y)))
            }
            "pick" | "p" => rest
                .trim()
                .parse()
                .map(Command::Pick)
                .map_err(|_| "usage: pick <bar number>".to_string()),
            "show" => Ok(Command::Show),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" | "q" => Ok(Command::Quit),
            "" => Err(String::new()),
            other => Err(format!("unknown command '{other}', try 'help'")),
        }
    }
}

const HELP: &str = "\
Commands:
  start <text>   set the output text and predict the next token
  click <x> <y>  click the chart at column x, row y
  pick <n>       click bar n (0 is the top bar)
  show           redraw the chart
  quit           exit";

type PredictionResult = (u64, next_token::Result<Vec<TokenProbability>>);

fn show(controller: &ChartController) {
    print!("{}", controller.chart().redraw());
    println!("Output: {}", controller.output());
}

fn dispatch(predictor: Arc<Predictor>, request: PredictionRequest, results: mpsc::UnboundedSender<PredictionResult>) {
    tokio::task::spawn_blocking(move || {
        let result = predictor.predict(&request.text);
        // the receiver only goes away when the session is shutting down
        let _ = results.send((request.seq, result));
    });
}

/// Turns a command into a prediction request, or handles it directly.
/// Returns `false` when the session should end.
fn handle(controller: &mut ChartController, command: Command, results: &mpsc::UnboundedSender<PredictionResult>) -> bool {
    let request = match command {
        Command::Quit => return false,
        Command::Help => {
            println!("{HELP}");
            return true;
        }
        Command::Show => {
            show(controller);
            return true;
        }
        Command::Start(text) => controller.start(&text).map(Some),
        Command::Click(pos) => controller.on_bar_clicked(pos),
        Command::Pick(n) => match controller.chart().bar_center(n) {
            Some(pos) => controller.on_bar_clicked(pos),
            None => {
                println!("no bar {n}");
                return true;
            }
        },
    };

    match request {
        Ok(Some(request)) => match controller.predictor() {
            Ok(predictor) => dispatch(predictor, request, results.clone()),
            Err(e) => warn!("{e}"),
        },
        Ok(None) => {}
        Err(Error::NotReady) => println!("The model is still loading."),
        Err(e) => error!("{e}"),
    }
    true
}

/// Runs the explorer until `quit` or end of input.
///
/// Loading and predictions run on blocking workers; progress and results
/// come back over channels and are applied here, on the one UI task.
pub async fn explore(loader: ModelLoader, top_k: usize, mut controller: ChartController) -> Result<()> {
    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let (results_tx, mut results_rx) = mpsc::unbounded_channel::<PredictionResult>();

    controller.begin_loading();
    let mut load = tokio::task::spawn_blocking(move || {
        loader.load(|event| {
            let _ = status_tx.send(event);
        })
    });
    let mut loading = true;
    let mut progress = LoadProgress::new();

    show(&controller);
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = status_rx.recv() => {
                if progress.update(&event) {
                    eprint!("{}", progress.render());
                }
            }
            joined = &mut load, if loading => {
                loading = false;
                let predictor = joined.context("model loader stopped")?.context("failed to load model")?;
                while let Ok(event) = status_rx.try_recv() {
                    progress.update(&event);
                }
                eprintln!("{}", progress.finish());
                controller.ready(predictor.with_top_k(top_k));
            }
            Some((seq, result)) = results_rx.recv() => {
                match controller.complete(seq, result) {
                    Ok(Completion::Applied) => show(&controller),
                    Ok(Completion::Stale) => {}
                    Err(e) => error!("prediction failed: {e}"),
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match line.parse::<Command>() {
                    Ok(command) => {
                        if !handle(&mut controller, command, &results_tx) {
                            break;
                        }
                    }
                    Err(msg) if msg.is_empty() => {}
                    Err(msg) => println!("{msg}"),
                }
            }
        }
    }
    Ok(())
}

/// Loads the model, predicts once from `text` and prints the chart.
pub fn predict_once(loader: &ModelLoader, top_k: usize, mut controller: ChartController, text: &str) -> Result<()> {
    let mut progress = LoadProgress::new();
    controller.begin_loading();
    let predictor = loader
        .load(|event| {
            if progress.update(&event) {
                eprint!("{}", progress.render());
            }
        })
        .context("failed to load model")?;
    eprintln!("{}", progress.finish());
    controller.ready(predictor.with_top_k(top_k));

    let request = controller.start(text)?;
    controller.predict_now(&request).context("prediction failed")?;
    show(&controller);
    Ok(())
}
