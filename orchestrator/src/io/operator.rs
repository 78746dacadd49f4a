//! Line-oriented operator interaction.
//!
//! The [`Operator`] trait keeps the approval gate and clarification flow
//! independent of the terminal. `None` from a question means the operator
//! interrupted (end of input).

use std::io::{BufRead, Write};

use tracing::debug;

pub trait Operator {
    /// Render informational text.
    fn show(&mut self, text: &str);
    /// Ask a single-choice question. Returns the index into `options`.
    fn choose(&mut self, question: &str, options: &[&str]) -> Option<usize>;
    /// Ask for free text. Returns the trimmed answer (possibly empty).
    fn ask_text(&mut self, question: &str) -> Option<String>;
}

/// Operator over a reader/writer pair (stdin/stderr in the binary).
pub struct ConsoleOperator<R: BufRead, W: Write> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> ConsoleOperator<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn write(&mut self, text: &str) {
        if let Err(err) = self
            .output
            .write_all(text.as_bytes())
            .and_then(|()| self.output.flush())
        {
            debug!(err = %err, "failed to write operator output");
        }
    }

    fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line.trim().to_string()),
            Err(err) => {
                debug!(err = %err, "failed to read operator input");
                None
            }
        }
    }
}

/// Accepts a 1-based number, an option name, or a prefix of exactly one option.
fn match_choice(answer: &str, options: &[&str]) -> Option<usize> {
    if let Ok(n) = answer.parse::<usize>() {
        return (1..=options.len()).contains(&n).then(|| n - 1);
    }
    let lowered = answer.to_lowercase();
    if lowered.is_empty() {
        return None;
    }
    if let Some(idx) = options.iter().position(|o| o.to_lowercase() == lowered) {
        return Some(idx);
    }
    let mut hits = options
        .iter()
        .enumerate()
        .filter(|(_, option)| option.to_lowercase().starts_with(&lowered));
    match (hits.next(), hits.next()) {
        (Some((idx, _)), None) => Some(idx),
        _ => None,
    }
}

impl<R: BufRead, W: Write> Operator for ConsoleOperator<R, W> {
    fn show(&mut self, text: &str) {
        self.write(text);
        if !text.ends_with('\n') {
            self.write("\n");
        }
    }

    fn choose(&mut self, question: &str, options: &[&str]) -> Option<usize> {
        let mut menu = format!("{question}\n");
        for (idx, option) in options.iter().enumerate() {
            menu.push_str(&format!("  {}) {option}\n", idx + 1));
        }
        self.write(&menu);
        loop {
            self.write("> ");
            let answer = self.read_line()?;
            if let Some(idx) = match_choice(&answer, options) {
                return Some(idx);
            }
            self.write(&format!("Please enter 1-{}.\n", options.len()));
        }
    }

    fn ask_text(&mut self, question: &str) -> Option<String> {
        self.write(&format!("{question}\n> "));
        self.read_line()
    }
}
