//! Run and recovery drivers over files on disk
//!
//! Scenarios:
//! - A run writes the ordered stream with its metadata and removes the checkpoint
//! - A partially failed run is completed by recovery, reusing its settings
//! - Recovery refuses a prior run over a different source text
//! - A rejected question set fails before any output is created

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use haystack::{
    read_stream, CharTokenizer, CheckpointWriter, DepthMode, EngineError, ModelCaller,
    ModelReply, ParsingStatus, Position, Question, QuestionType, Validation,
};
use haystack_bench::run::fresh_settings;
use haystack_bench::{recover_tests, run_tests, Engine, RunInputs, SettingsOverrides};
use serde_json::json;

const SOURCE_LEN: usize = 12_000;

fn source_text(offset: u8) -> String {
    (0..SOURCE_LEN)
        .map(|i| (b'a' + ((i + offset as usize) % 26) as u8) as char)
        .collect()
}

fn question(n: usize) -> Question {
    let start = 1_000 + n * 1_800;
    Question {
        question: format!("Question #{n}: which option?"),
        question_type: QuestionType::SingleChoice,
        choice: [("a", "yes"), ("b", "no")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        answer: vec!["a".to_string()],
        position: Position::new(start, start + 40),
        validation: Some(Validation {
            is_valid: true,
            failure_reasons: Vec::new(),
        }),
    }
}

fn write_questions(path: &Path, questions: &[Question]) {
    let mut lines = vec![json!({"metadata": {"generator": "fixture"}}).to_string()];
    lines.extend(questions.iter().map(|q| serde_json::to_string(q).unwrap()));
    std::fs::write(path, lines.join("\n") + "\n").unwrap();
}

struct Fixture {
    _dir: tempfile::TempDir,
    inputs: RunInputs,
}

fn fixture(questions: &[Question]) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("novel.txt");
    let question_path = dir.path().join("questions.jsonl");
    std::fs::write(&source, source_text(0)).unwrap();
    write_questions(&question_path, questions);
    let inputs = RunInputs {
        source,
        questions: question_path,
        output: dir.path().join("out").join("results.jsonl"),
        prompt_template: None,
        skip_validation: false,
        ignore_invalid: false,
    };
    Fixture { _dir: dir, inputs }
}

/// Answers "a" except for the listed question numbers, which get no answer.
struct Scripted {
    failing: HashSet<String>,
    calls: AtomicUsize,
}

impl Scripted {
    fn new(failing: &[usize]) -> Self {
        Self {
            failing: failing
                .iter()
                .map(|n| format!("Question #{n}:"))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModelCaller for Scripted {
    async fn answer_question(&self, _system: &str, user: &str) -> ModelReply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.iter().any(|tag| user.contains(tag.as_str())) {
            return ModelReply::no_answer("request timed out");
        }
        ModelReply::Text(r#"Sure. {"answer": ["a"]}"#.to_string())
    }
}

fn engine(caller: Arc<Scripted>) -> Engine {
    Engine {
        tokenizer: Arc::new(CharTokenizer),
        caller,
        model_name: "scripted".to_string(),
        config: json!({"model_name": "scripted", "api_key": "***"}),
    }
}

fn overrides() -> SettingsOverrides {
    SettingsOverrides {
        context_lengths: Some(vec![1_000, 2_000]),
        padding_size: Some(10),
        concurrency: Some(2),
        ..SettingsOverrides::default()
    }
}

fn checkpoint_of(output: &Path) -> PathBuf {
    CheckpointWriter::path_for(output)
}

#[tokio::test]
async fn run_writes_ordered_stream_and_removes_checkpoint() {
    let qs: Vec<Question> = (0..6).map(question).collect();
    let fx = fixture(&qs);
    let caller = Arc::new(Scripted::new(&[]));
    let settings = fresh_settings(&overrides()).unwrap();

    let report = run_tests(&engine(caller.clone()), &fx.inputs, &settings)
        .await
        .unwrap();

    assert_eq!(caller.calls.load(Ordering::SeqCst), 6);
    assert_eq!(report.results.len(), 6);
    assert_eq!(report.summary.mean_score, 1.0);
    assert!(!checkpoint_of(&fx.inputs.output).exists());

    let (header, results) = read_stream(&fx.inputs.output).unwrap();
    let header = header.unwrap();
    assert_eq!(header.model_name, "scripted");
    assert_eq!(header.depth_mode, DepthMode::Uniform);
    assert_eq!(header.context_lengths, vec![1_000, 2_000]);
    assert_eq!(header.source_tokens, SOURCE_LEN);
    assert_eq!(header.total_questions, 6);
    assert_eq!(header.question_set_metadata, Some(json!({"generator": "fixture"})));
    assert!(header.recovery.is_none());
    for (i, r) in results.iter().enumerate() {
        assert_eq!(r.question_index, Some(i));
        assert_eq!(r.parsing_status, ParsingStatus::RegexExtracted);
    }
}

#[tokio::test]
async fn recovery_completes_a_partially_failed_run() {
    let qs: Vec<Question> = (0..6).map(question).collect();
    let fx = fixture(&qs);
    let settings = fresh_settings(&overrides()).unwrap();

    let first = run_tests(&engine(Arc::new(Scripted::new(&[1, 4]))), &fx.inputs, &settings)
        .await
        .unwrap();
    assert_eq!(first.summary.status_count(ParsingStatus::Timeout), 2);

    let retry = Arc::new(Scripted::new(&[]));
    let mut inputs = fx.inputs.clone();
    inputs.output = fx.inputs.output.with_file_name("recovered.jsonl");
    let report = recover_tests(
        &engine(retry.clone()),
        &fx.inputs.output,
        &inputs,
        &SettingsOverrides {
            concurrency: Some(2),
            ..SettingsOverrides::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(retry.calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.results.len(), 6);
    assert!(report.results.iter().all(|r| r.score == 1.0));
    assert_eq!(report.metadata.context_lengths, vec![1_000, 2_000]);
    assert_eq!(report.metadata.padding_size, 10);

    let recovery = report.metadata.recovery.as_ref().unwrap();
    assert_eq!(recovery.kept, 4);
    assert_eq!(recovery.retried, 2);
    assert_eq!(recovery.discarded, 0);
    assert!(!checkpoint_of(&inputs.output).exists());

    let (header, _) = read_stream(&inputs.output).unwrap();
    assert_eq!(header.unwrap().recovery, report.metadata.recovery);
}

#[tokio::test]
async fn recovery_refuses_a_different_source() {
    let qs: Vec<Question> = (0..6).map(question).collect();
    let fx = fixture(&qs);
    let settings = fresh_settings(&overrides()).unwrap();
    run_tests(&engine(Arc::new(Scripted::new(&[2]))), &fx.inputs, &settings)
        .await
        .unwrap();

    std::fs::write(&fx.inputs.source, source_text(3)).unwrap();
    let retry = Arc::new(Scripted::new(&[]));
    let err = recover_tests(
        &engine(retry.clone()),
        &fx.inputs.output,
        &fx.inputs,
        &SettingsOverrides::default(),
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("refusing to recover"), "{err:#}");
    assert_eq!(retry.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejected_question_set_creates_no_output() {
    let mut qs: Vec<Question> = (0..4).map(question).collect();
    qs[1].validation = None;
    let fx = fixture(&qs);
    let caller = Arc::new(Scripted::new(&[]));
    let settings = fresh_settings(&overrides()).unwrap();

    let err = run_tests(&engine(caller.clone()), &fx.inputs, &settings)
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::BatchRejected { .. })
    ));
    assert_eq!(caller.calls.load(Ordering::SeqCst), 0);
    assert!(!fx.inputs.output.exists());
    assert!(!checkpoint_of(&fx.inputs.output).exists());
}
