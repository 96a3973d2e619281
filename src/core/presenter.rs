use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use dialoguer::Select;
use thiserror::Error;

use crate::core::hash::PerceptualHash;
use crate::core::metadata::CaptureSource;
use crate::core::scanner::{ImageFile, Source};

#[derive(Debug, Error)]
pub enum PresenterError {
    #[error("Prompt failed: {0}")]
    Prompt(#[from] dialoguer::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The outcome of reviewing one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Keep the target, delete every other member.
    KeepOne(PathBuf),
    DeleteAll,
    /// Keep every member.
    Keep,
    /// Leave the group untouched.
    NoAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Operator,
    Timeout,
}

/// Holds a group's decision. Only the first `resolve` call takes effect, so a
/// late timer cannot override the operator and vice versa.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DecisionSlot {
    #[default]
    Pending,
    Resolved { decision: Decision, trigger: Trigger },
}

impl DecisionSlot {
    pub fn resolve(&mut self, decision: Decision, trigger: Trigger) -> bool {
        match self {
            DecisionSlot::Pending => {
                *self = DecisionSlot::Resolved { decision, trigger };
                true
            }
            DecisionSlot::Resolved { .. } => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, DecisionSlot::Pending)
    }

    pub fn into_resolved(self) -> Option<(Decision, Trigger)> {
        match self {
            DecisionSlot::Pending => None,
            DecisionSlot::Resolved { decision, trigger } => Some((decision, trigger)),
        }
    }
}

/// One member of a group as shown to the operator.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub file: ImageFile,
    pub hash: PerceptualHash,
}

impl Candidate {
    pub fn path(&self) -> &Path {
        &self.file.path
    }
}

/// A group ready for presentation, candidates in canonical order.
pub struct ReviewGroup<'a> {
    pub position: usize,
    pub total: usize,
    pub candidates: &'a [Candidate],
}

impl ReviewGroup<'_> {
    /// What an automatic resolution picks: keep the leftmost candidate.
    pub fn leftmost_decision(&self) -> Decision {
        self.candidates
            .first()
            .map(|c| Decision::KeepOne(c.path().to_path_buf()))
            .unwrap_or(Decision::NoAction)
    }
}

/// Decision port between the review engine and whoever makes the call.
pub trait Presenter {
    fn present(&mut self, group: &ReviewGroup<'_>) -> Result<Decision, PresenterError>;
}

impl<P: Presenter + ?Sized> Presenter for Box<P> {
    fn present(&mut self, group: &ReviewGroup<'_>) -> Result<Decision, PresenterError> {
        (**self).present(group)
    }
}

/// No display at all: always keeps the leftmost candidate.
pub struct HeadlessPresenter;

impl Presenter for HeadlessPresenter {
    fn present(&mut self, group: &ReviewGroup<'_>) -> Result<Decision, PresenterError> {
        Ok(group.leftmost_decision())
    }
}

/// Terminal review. Without a timeout it shows a selection menu; with one it
/// reads typed choices and keeps the leftmost candidate once time runs out.
pub struct TerminalPresenter {
    timeout: Option<Duration>,
    input: Option<Receiver<String>>,
}

impl TerminalPresenter {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            input: None,
        }
    }

    fn prompt_menu(&self, group: &ReviewGroup<'_>) -> Result<Decision, PresenterError> {
        let mut items: Vec<String> = group
            .candidates
            .iter()
            .enumerate()
            .map(|(i, c)| format!("Keep #{} {}", i + 1, describe(c)))
            .collect();
        items.push("Delete all".to_string());
        items.push("Keep all".to_string());
        items.push("Skip".to_string());

        let n = group.candidates.len();
        let choice = Select::new()
            .with_prompt("Which image should stay?")
            .items(&items)
            .default(0)
            .interact_opt()?;

        Ok(match choice {
            Some(i) if i < n => Decision::KeepOne(group.candidates[i].path().to_path_buf()),
            Some(i) if i == n => Decision::DeleteAll,
            Some(i) if i == n + 1 => Decision::Keep,
            _ => Decision::NoAction,
        })
    }
}

impl Presenter for TerminalPresenter {
    fn present(&mut self, group: &ReviewGroup<'_>) -> Result<Decision, PresenterError> {
        println!(
            "\n✨ Group {}/{} ({} images)",
            group.position,
            group.total,
            group.candidates.len()
        );
        for (i, candidate) in group.candidates.iter().enumerate() {
            println!("   [{}] {}", i + 1, describe(candidate));
        }

        let Some(timeout) = self.timeout else {
            return self.prompt_menu(group);
        };

        let input = self.input.get_or_insert_with(spawn_line_reader);
        // Lines typed while the previous group was resolving belong to nobody.
        while input.try_recv().is_ok() {}

        println!(
            "   Enter = keep #1, 1-{} = keep that one, l = keep last, d = delete all, k = keep all, s = skip (auto in {}s)",
            group.candidates.len(),
            timeout.as_secs()
        );
        let (decision, trigger) = await_decision(input, group, timeout);
        if trigger == Trigger::Timeout {
            println!("   ⏱  No response; keeping the leftmost image");
        }
        Ok(decision)
    }
}

fn spawn_line_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Wait for a valid typed choice until `timeout` elapses, then fall back to
/// the leftmost candidate. A closed input resolves immediately.
pub fn await_decision(
    input: &Receiver<String>,
    group: &ReviewGroup<'_>,
    timeout: Duration,
) -> (Decision, Trigger) {
    let deadline = Instant::now() + timeout;
    let mut slot = DecisionSlot::Pending;

    while slot.is_pending() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match input.recv_timeout(remaining) {
            Ok(line) => match parse_choice(&line, group.candidates) {
                Some(decision) => {
                    slot.resolve(decision, Trigger::Operator);
                }
                None => println!("   Unrecognised choice {:?}", line.trim()),
            },
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                slot.resolve(group.leftmost_decision(), Trigger::Timeout);
            }
        }
    }

    slot.into_resolved()
        .unwrap_or((Decision::NoAction, Trigger::Timeout))
}

/// Interpret one line of operator input.
pub fn parse_choice(line: &str, candidates: &[Candidate]) -> Option<Decision> {
    let keep = |c: &Candidate| Decision::KeepOne(c.path().to_path_buf());
    match line.trim().to_lowercase().as_str() {
        "" => candidates.first().map(keep),
        "l" | "last" => candidates.last().map(keep),
        "d" | "delete" => Some(Decision::DeleteAll),
        "k" | "keep" => Some(Decision::Keep),
        "s" | "skip" => Some(Decision::NoAction),
        other => {
            let n: usize = other.parse().ok()?;
            n.checked_sub(1)
                .and_then(|i| candidates.get(i))
                .map(keep)
        }
    }
}

fn describe(candidate: &Candidate) -> String {
    let file = &candidate.file;
    let megapixels = file.resolution() as f64 / 1_000_000.0;
    let captured = match file.capture_time() {
        Some(c) => {
            let origin = match c.source {
                CaptureSource::Exif => "exif",
                CaptureSource::Filename => "name",
                CaptureSource::Filesystem => "file date",
            };
            format!("{} ({})", c.at.format("%Y-%m-%d %H:%M"), origin)
        }
        None => "unknown date".to_string(),
    };
    let origin = match file.source {
        Source::Primary => "",
        Source::Import => "  [import]",
    };
    format!(
        "{}  {:.1} MP  {}{}",
        file.path.display(),
        megapixels,
        captured,
        origin
    )
}
