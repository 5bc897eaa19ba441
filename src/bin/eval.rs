use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use docqa::models::{Answer, AnswerOutcome, QueryRequest};
use docqa::{AppConfig, AppState};

#[derive(Parser, Debug)]
#[command(name = "eval")]
#[command(about = "Run an evaluation set of questions through the answer engine")]
struct Cli {
    #[arg(long, default_value = "eval/prompts.jsonl")]
    file: String,
    /// Exit with an error when fewer prompts than this fraction pass.
    #[arg(long)]
    min_pass_rate: Option<f32>,
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct EvalPrompt {
    id: String,
    question: String,
    #[serde(default)]
    expect_contains: Vec<String>,
    #[serde(default)]
    expect_no_context: Option<bool>,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    confidence_threshold: Option<f32>,
}

#[derive(Debug, PartialEq)]
struct Verdict {
    passed: bool,
    missing: Vec<String>,
    no_context: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let prompts = load_prompts(Path::new(&cli.file))?;
    if prompts.is_empty() {
        anyhow::bail!("no prompts found in {}", cli.file);
    }

    let config = AppConfig::from_env().context("invalid configuration")?;
    let state = AppState::from_config(config)
        .await
        .context("failed to initialise services")?;

    let mut passed = 0usize;
    let mut no_context = 0usize;
    let mut with_sources = 0usize;
    let mut confidence_sum = 0f32;
    let mut latency_sum = 0u128;

    for prompt in &prompts {
        let answer = state
            .engine
            .answer(QueryRequest {
                question: prompt.question.clone(),
                top_k: prompt.top_k,
                confidence_threshold: prompt.confidence_threshold,
                document_ids: None,
            })
            .await
            .with_context(|| format!("failed eval prompt {}", prompt.id))?;

        let verdict = judge(prompt, &answer);
        if verdict.passed {
            passed += 1;
        }
        if verdict.no_context {
            no_context += 1;
        }
        if !answer.sources.is_empty() {
            with_sources += 1;
        }
        confidence_sum += answer.confidence;
        latency_sum += answer.response_time_ms;

        if cli.verbose || !verdict.passed {
            println!(
                "--- {} [{}] ---",
                prompt.id,
                if verdict.passed { "pass" } else { "FAIL" }
            );
            println!("Q: {}", prompt.question);
            println!("A: {}", answer.answer.replace('\n', " "));
            println!(
                "Sources: {}  confidence: {:.3}",
                answer.sources.len(),
                answer.confidence
            );
            if !verdict.missing.is_empty() {
                println!("Missing: {}", verdict.missing.join(", "));
            }
            println!();
        }
    }

    let total = prompts.len();
    let pass_rate = ratio(passed, total);
    println!("Eval prompts: {}", total);
    println!("Pass rate: {:.1}% ({}/{})", pass_rate * 100.0, passed, total);
    println!("No-context rate: {:.1}%", ratio(no_context, total) * 100.0);
    println!("Answers with sources: {:.1}%", ratio(with_sources, total) * 100.0);
    println!("Mean confidence: {:.3}", confidence_sum / total as f32);
    println!("Mean response time: {} ms", latency_sum / total as u128);

    if let Some(min) = cli.min_pass_rate {
        if pass_rate < min {
            anyhow::bail!("pass rate {:.3} below required {:.3}", pass_rate, min);
        }
    }
    Ok(())
}

/// A prompt passes when the no-context expectation holds and every
/// expected phrase appears in the answer, case-insensitively.
fn judge(prompt: &EvalPrompt, answer: &Answer) -> Verdict {
    let no_context = answer.outcome == AnswerOutcome::NoContext;
    let lower = answer.answer.to_lowercase();
    let missing: Vec<String> = prompt
        .expect_contains
        .iter()
        .filter(|needle| !lower.contains(&needle.to_lowercase()))
        .cloned()
        .collect();

    let context_ok = prompt.expect_no_context.unwrap_or(false) == no_context;
    Verdict {
        passed: context_ok && missing.is_empty(),
        missing,
        no_context,
    }
}

fn load_prompts(path: &Path) -> Result<Vec<EvalPrompt>> {
    let file = File::open(path).with_context(|| format!("failed opening {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut prompts = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let parsed: EvalPrompt = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON at {} line {}", path.display(), idx + 1))?;
        prompts.push(parsed);
    }

    Ok(prompts)
}

fn ratio(n: usize, d: usize) -> f32 {
    if d == 0 {
        return 0.0;
    }
    n as f32 / d as f32
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
