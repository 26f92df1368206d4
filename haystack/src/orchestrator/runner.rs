//! Bounded-concurrency execution of a test plan.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::model::{ModelCaller, ModelReply};
use super::plan::{Placement, TestCase, TestPlan, DEFAULT_CONCURRENCY};
use super::ResultObserver;
use crate::answer::{is_valid_answer, parse_answer, score_answer};
use crate::context::ContextBuilder;
use crate::error::EngineResult;
use crate::prompt::PromptTemplate;
use crate::question::Question;
use crate::results::{ParsingStatus, TestResult};

/// Drives a [`TestPlan`] against a model.
///
/// Each case runs as its own task behind a counting semaphore. Whatever
/// happens inside a case (context build failure, no answer, unparseable
/// reply, panic) becomes that case's result; the batch always returns one
/// result per case, in plan order.
pub struct TestOrchestrator {
    builder: ContextBuilder,
    prompts: PromptTemplate,
    concurrency: usize,
    observer: Option<Arc<dyn ResultObserver>>,
}

/// Read-only state shared by every case task.
struct CaseEnv {
    builder: ContextBuilder,
    prompts: PromptTemplate,
    padding: usize,
    questions: Arc<[Question]>,
    caller: Arc<dyn ModelCaller>,
    /// Decoded prefix context for legacy plans.
    prefix: Option<Arc<str>>,
}

impl TestOrchestrator {
    pub fn new(builder: ContextBuilder, prompts: PromptTemplate) -> Self {
        Self {
            builder,
            prompts,
            concurrency: DEFAULT_CONCURRENCY,
            observer: None,
        }
    }

    /// Maximum in-flight cases (at least 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Notify `observer` as each case completes.
    pub fn with_observer(mut self, observer: Arc<dyn ResultObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run every case of `plan`. Returns exactly `plan.len()` results in plan order.
    ///
    /// Errors only when the plan references questions outside `questions`.
    pub async fn run(
        &self,
        questions: Arc<[Question]>,
        plan: &TestPlan,
        caller: Arc<dyn ModelCaller>,
    ) -> EngineResult<Vec<TestResult>> {
        plan.check_against(questions.len())?;
        let all: Vec<usize> = (0..plan.len()).collect();
        let mut done = self.run_cases(questions, plan, &all, caller).await;
        Ok(all
            .iter()
            .filter_map(|case_idx| done.remove(case_idx))
            .collect())
    }

    /// Execute the cases at `case_indices` and return their results keyed by
    /// case index. Every requested index gets a result.
    pub(crate) async fn run_cases(
        &self,
        questions: Arc<[Question]>,
        plan: &TestPlan,
        case_indices: &[usize],
        caller: Arc<dyn ModelCaller>,
    ) -> HashMap<usize, TestResult> {
        let started = Instant::now();
        let total = case_indices.len();

        let prefix = plan.cases().iter().find_map(|c| match c.placement {
            Placement::Prefix { context_length } => Some(context_length),
            Placement::Depth { .. } => None,
        });
        let env = Arc::new(CaseEnv {
            builder: self.builder.clone(),
            prompts: self.prompts.clone(),
            padding: plan.padding_size(),
            questions,
            caller,
            prefix: prefix.map(|len| Arc::from(self.builder.prefix(len))),
        });

        info!(cases = total, concurrency = self.concurrency, "executing test cases");

        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<(usize, TestResult)> = JoinSet::new();

        for &case_idx in case_indices {
            let case = plan.cases()[case_idx];
            let sem = sem.clone();
            let env = env.clone();

            join_set.spawn(async move {
                let question = &env.questions[case.question_index];
                let Ok(_permit) = sem.acquire().await else {
                    return (case_idx, error_record(question, case, "admission gate closed"));
                };

                debug!(case = case_idx, question = case.question_index, "testing case");
                let result = match AssertUnwindSafe(run_case(&env, question, case))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        warn!(case = case_idx, error = %message, "test case panicked");
                        error_record(question, case, &message)
                    }
                };
                (case_idx, result)
            });
        }

        let mut results = HashMap::with_capacity(total);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((case_idx, result)) => {
                    if let Some(observer) = &self.observer {
                        observer.on_result(case_idx, &result);
                    }
                    results.insert(case_idx, result);
                }
                Err(e) => warn!(error = %e, "test case task failed"),
            }
        }

        // A task lost to cancellation still owes its case a record.
        for &case_idx in case_indices {
            if results.contains_key(&case_idx) {
                continue;
            }
            let case = plan.cases()[case_idx];
            let record = error_record(
                &env.questions[case.question_index],
                case,
                "test case task did not complete",
            );
            if let Some(observer) = &self.observer {
                observer.on_result(case_idx, &record);
            }
            results.insert(case_idx, record);
        }

        info!(
            cases = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "test cases complete"
        );
        results
    }
}

/// Context, model call, parse, score. Every branch yields a record.
async fn run_case(env: &CaseEnv, question: &Question, case: TestCase) -> TestResult {
    let mut record = blank_record(question, case);

    let built;
    let context: &str = match case.placement {
        Placement::Depth {
            target_depth,
            context_length,
            ..
        } => {
            built = env
                .builder
                .build(question, target_depth, context_length, env.padding);
            if !built.success {
                let message = built
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "context build failed".to_string());
                debug!(question = case.question_index, error = %message, "context build failed");
                record.parsing_status = ParsingStatus::ContextBuildError;
                record.error_message = Some(message);
                return record;
            }
            record.depth = Some(built.actual_depth);
            &built.context
        }
        Placement::Prefix { .. } => env.prefix.as_deref().unwrap_or_default(),
    };

    let (system, user) = env
        .prompts
        .render(context, &question.question, &question.choice);

    match env.caller.answer_question(&system, &user).await {
        ModelReply::NoAnswer { reason } => {
            warn!(question = case.question_index, reason = %reason, "model returned no answer");
            record.parsing_status = ParsingStatus::Timeout;
            record.error_message = Some(reason);
        }
        ModelReply::Text(text) => {
            let parsed = parse_answer(&text);
            let score = score_answer(&question.answer, &parsed.answer, question.question_type);
            let keys: Vec<&str> = question.choice.keys().map(String::as_str).collect();

            record.answer_in_choices = is_valid_answer(&parsed.answer, &keys);
            record.model_answer = parsed.answer;
            record.parsing_status = parsed.status;
            record.score = score.score;
            record.metrics = score.metrics;
        }
    }
    record
}

/// Record for `case` with question fields echoed and a zero score.
fn blank_record(question: &Question, case: TestCase) -> TestResult {
    let (target_depth, depth_bin, test_context_length) = match case.placement {
        Placement::Depth {
            target_depth,
            depth_bin,
            context_length,
        } => (Some(target_depth), Some(depth_bin), Some(context_length)),
        Placement::Prefix { .. } => (None, None, None),
    };

    TestResult {
        question_index: Some(case.question_index),
        question: question.question.clone(),
        question_type: question.question_type,
        choice: question.choice.clone(),
        correct_answer: question.answer.clone(),
        model_answer: Vec::new(),
        parsing_status: ParsingStatus::Error,
        score: 0.0,
        metrics: None,
        answer_in_choices: false,
        depth: None,
        target_depth,
        depth_bin,
        test_context_length,
        position: question.position,
        error_message: None,
    }
}

fn error_record(question: &Question, case: TestCase, message: &str) -> TestResult {
    let mut record = blank_record(question, case);
    record.error_message = Some(message.to_string());
    record
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "test case panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth::DepthMode;
    use crate::orchestrator::model::MockModelCaller;
    use crate::orchestrator::plan::RunSettings;
    use crate::question::fixtures::question;
    use crate::question::QuestionType;
    use crate::tokenizer::CharTokenizer;
    use std::sync::Mutex;

    fn source(len: usize) -> String {
        (0..len).map(|i| (b'a' + (i % 26) as u8) as char).collect()
    }

    fn orchestrator(len: usize) -> TestOrchestrator {
        let builder = ContextBuilder::from_text(Arc::new(CharTokenizer), &source(len));
        TestOrchestrator::new(builder, PromptTemplate::default()).with_concurrency(2)
    }

    fn plan(questions: &[Question], lengths: &[usize]) -> TestPlan {
        let settings = RunSettings {
            mode: DepthMode::Uniform,
            context_lengths: lengths.to_vec(),
            padding_size: 10,
            ..RunSettings::default()
        };
        TestPlan::build(questions, 10_000, &settings).unwrap()
    }

    #[tokio::test]
    async fn scores_clean_replies() {
        let qs: Arc<[Question]> = (0..5)
            .map(|i| question(2_000 + i * 100, 2_050 + i * 100))
            .collect();
        let p = plan(&qs, &[1_000]);

        let mut caller = MockModelCaller::new();
        caller
            .expect_answer_question()
            .times(5)
            .returning(|_, _| ModelReply::Text(r#"{"answer": ["a"]}"#.to_string()));

        let results = orchestrator(10_000).run(qs, &p, Arc::new(caller)).await.unwrap();
        assert_eq!(results.len(), 5);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.question_index, Some(i));
            assert_eq!(r.parsing_status, ParsingStatus::Success);
            assert_eq!(r.score, 1.0);
            assert!(r.answer_in_choices);
            assert!(r.depth.is_some());
            assert_eq!(r.test_context_length, Some(1_000));
        }
    }

    #[tokio::test]
    async fn no_answer_becomes_timeout() {
        let qs: Arc<[Question]> = vec![question(3_000, 3_050)].into();
        let p = plan(&qs, &[1_000]);

        let mut caller = MockModelCaller::new();
        caller
            .expect_answer_question()
            .returning(|_, _| ModelReply::no_answer("retries exhausted"));

        let results = orchestrator(10_000).run(qs, &p, Arc::new(caller)).await.unwrap();
        assert_eq!(results[0].parsing_status, ParsingStatus::Timeout);
        assert_eq!(results[0].score, 0.0);
        assert_eq!(results[0].error_message.as_deref(), Some("retries exhausted"));
    }

    #[tokio::test]
    async fn unbuildable_context_skips_the_model() {
        // 1_100 evidence tokens plus padding cannot fit a 1_000-token context.
        let qs: Arc<[Question]> = vec![question(100, 150), question(4_000, 5_100)].into();
        let p = plan(&qs, &[1_000]);

        let mut caller = MockModelCaller::new();
        caller
            .expect_answer_question()
            .times(1)
            .returning(|_, _| ModelReply::Text(r#"{"answer": ["b"]}"#.to_string()));

        let results = orchestrator(10_000).run(qs, &p, Arc::new(caller)).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].parsing_status, ParsingStatus::Success);
        assert_eq!(results[0].score, 0.0);
        assert_eq!(results[1].parsing_status, ParsingStatus::ContextBuildError);
        assert!(results[1].depth.is_none());
        assert_eq!(results[1].test_context_length, Some(1_000));
    }

    #[tokio::test]
    async fn unparseable_multiple_choice_reply_keeps_zero_metrics() {
        let mut q = question(3_000, 3_050);
        q.question_type = QuestionType::MultipleChoice;
        q.answer = vec!["a".to_string(), "c".to_string()];
        let qs: Arc<[Question]> = vec![q].into();
        let p = plan(&qs, &[1_000]);

        let mut caller = MockModelCaller::new();
        caller
            .expect_answer_question()
            .returning(|_, _| ModelReply::Text("I am not sure.".to_string()));

        let results = orchestrator(10_000).run(qs, &p, Arc::new(caller)).await.unwrap();
        assert_eq!(results[0].parsing_status, ParsingStatus::ParsingError);
        assert_eq!(results[0].score, 0.0);
        let metrics = results[0].metrics.unwrap();
        assert_eq!((metrics.precision, metrics.recall, metrics.f1), (0.0, 0.0, 0.0));
    }

    #[tokio::test]
    async fn panicking_caller_becomes_error_record() {
        let qs: Arc<[Question]> = vec![question(3_000, 3_050), question(5_000, 5_050)].into();
        let p = plan(&qs, &[1_000]);

        struct Explosive;
        #[async_trait::async_trait]
        impl ModelCaller for Explosive {
            async fn answer_question(&self, _system: &str, user: &str) -> ModelReply {
                if user.contains("token 3000") {
                    panic!("boom");
                }
                ModelReply::Text(r#"{"answer": ["a"]}"#.to_string())
            }
        }

        let results = orchestrator(10_000).run(qs, &p, Arc::new(Explosive)).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].parsing_status, ParsingStatus::Error);
        assert_eq!(results[0].error_message.as_deref(), Some("boom"));
        assert_eq!(results[1].parsing_status, ParsingStatus::Success);
    }

    #[tokio::test]
    async fn observer_sees_every_case() {
        struct Collect(Mutex<Vec<usize>>);
        impl ResultObserver for Collect {
            fn on_result(&self, index: usize, _result: &TestResult) {
                self.0.lock().unwrap().push(index);
            }
        }

        let qs: Arc<[Question]> = (0..4)
            .map(|i| question(2_000 + i * 500, 2_040 + i * 500))
            .collect();
        let p = plan(&qs, &[1_000]);
        let mut caller = MockModelCaller::new();
        caller
            .expect_answer_question()
            .returning(|_, _| ModelReply::Text("no json here".to_string()));

        let seen = Arc::new(Collect(Mutex::new(Vec::new())));
        let results = orchestrator(10_000)
            .with_observer(seen.clone())
            .run(qs, &p, Arc::new(caller))
            .await
            .unwrap();

        assert!(results.iter().all(|r| r.parsing_status == ParsingStatus::ParsingError));
        let mut indices = seen.0.lock().unwrap().clone();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn legacy_plan_shares_the_prefix_context() {
        let qs: Arc<[Question]> = vec![question(10, 20), question(100, 200)].into();
        let settings = RunSettings {
            mode: DepthMode::Legacy,
            context_lengths: vec![300],
            padding_size: 50,
            ..RunSettings::default()
        };
        let p = TestPlan::build(&qs, 10_000, &settings).unwrap();

        let mut caller = MockModelCaller::new();
        caller
            .expect_answer_question()
            .times(2)
            .withf(|_, user| user.contains(&source(300)) && !user.contains(&source(301)))
            .returning(|_, _| ModelReply::Text(r#"{"answer": "a"}"#.to_string()));

        let results = orchestrator(10_000).run(qs, &p, Arc::new(caller)).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.depth_bin.is_none() && r.depth.is_none()));
        assert!(results.iter().all(|r| r.score == 1.0));
    }
}
