//! Multi-turn conversation handling.
//!
//! Each call to [`ConversationManager::ask`] is one turn:
//!
//! ```text
//! Received → Searching → FoundResults | NoResults → ResponseGenerated → Appended
//!                 └────→ Error   (neither retrieval path reachable)
//! ```
//!
//! A turn that ends in `Error` is not appended; the caller gets
//! [`QueryStatus::Unavailable`] and its history back exactly as sent, with
//! no eviction. Successful turns append the user query and the generated
//! answer, then evict the oldest turns beyond `max_turns`.
//!
//! History is owned by the caller's session and passed in with every
//! request. The manager itself keeps no per-session state, so one instance
//! can serve any number of sessions concurrently.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::generator::{AnswerContext, AnswerGenerator, TemplateGenerator};
use crate::models::{
    ConversationTurn, QueryRequest, QueryResponse, QueryStatus, ResultSummary, Role,
};
use crate::planner::HybridPlanner;
use crate::retry::{with_retry, RetryPolicy};

pub const UNAVAILABLE_ANSWER: &str =
    "No results are available right now: the search index could not be reached. Please try again shortly.";

/// Bounded FIFO of conversation turns.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<ConversationTurn>,
    max_turns: usize,
}

impl ConversationHistory {
    pub fn new(max_turns: usize) -> Self {
        let max_turns = max_turns.max(1);
        Self {
            turns: VecDeque::with_capacity(max_turns),
            max_turns,
        }
    }

    /// Keeps only the last `max_turns` of `turns`.
    pub fn from_turns(turns: impl IntoIterator<Item = ConversationTurn>, max_turns: usize) -> Self {
        let mut history = Self::new(max_turns);
        for turn in turns {
            history.push(turn);
        }
        history
    }

    /// Append, evicting the oldest turn when full.
    pub fn push(&mut self, turn: ConversationTurn) {
        while self.turns.len() >= self.max_turns {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    /// Content of the last `n` user turns, oldest first.
    pub fn recent_user_queries(&self, n: usize) -> Vec<&str> {
        let mut recent: Vec<&str> = self
            .turns
            .iter()
            .rev()
            .filter(|t| t.role == Role::User)
            .take(n)
            .map(|t| t.content.as_str())
            .collect();
        recent.reverse();
        recent
    }

    pub fn to_vec(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Received,
    Searching,
    FoundResults,
    NoResults,
    ResponseGenerated,
    Appended,
    Error,
}

impl TurnState {
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, next),
            (Received, Searching)
                | (Searching, FoundResults)
                | (Searching, NoResults)
                | (Searching, Error)
                | (FoundResults, ResponseGenerated)
                | (NoResults, ResponseGenerated)
                | (ResponseGenerated, Appended)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TurnState::Appended | TurnState::Error)
    }
}

/// States visited by one turn, in order.
#[derive(Debug, Clone)]
pub struct TurnTrace {
    states: Vec<TurnState>,
}

impl Default for TurnTrace {
    fn default() -> Self {
        Self {
            states: vec![TurnState::Received],
        }
    }
}

impl TurnTrace {
    pub fn current(&self) -> TurnState {
        self.states
            .last()
            .copied()
            .unwrap_or(TurnState::Received)
    }

    pub fn states(&self) -> &[TurnState] {
        &self.states
    }

    fn advance(&mut self, next: TurnState) {
        let from = self.current();
        if !from.can_transition_to(next) {
            tracing::error!(?from, to = ?next, "illegal conversation turn transition");
        }
        self.states.push(next);
    }
}

pub struct ConversationManager {
    planner: Arc<HybridPlanner>,
    generator: Arc<dyn AnswerGenerator>,
    fallback: TemplateGenerator,
    max_turns: usize,
    default_top_k: usize,
    history_turns: usize,
    generator_policy: RetryPolicy,
}

impl ConversationManager {
    pub fn new(
        planner: Arc<HybridPlanner>,
        generator: Arc<dyn AnswerGenerator>,
        config: &Config,
    ) -> Self {
        Self {
            planner,
            generator,
            fallback: TemplateGenerator,
            max_turns: config.conversation.max_turns,
            default_top_k: config.retrieval.top_k,
            history_turns: config.retrieval.history_turns,
            generator_policy: RetryPolicy::new(
                config.generator.max_retries,
                Duration::from_secs(config.generator.timeout_secs),
            ),
        }
    }

    pub fn with_generator_backoff(mut self, base_delay: Duration) -> Self {
        self.generator_policy = self.generator_policy.with_base_delay(base_delay);
        self
    }

    pub async fn ask(&self, request: &QueryRequest) -> QueryResponse {
        self.ask_traced(request).await.0
    }

    /// Like [`ask`](Self::ask), also returning the states the turn went through.
    pub async fn ask_traced(&self, request: &QueryRequest) -> (QueryResponse, TurnTrace) {
        let mut trace = TurnTrace::default();
        let mut history =
            ConversationHistory::from_turns(request.conversation_history.iter().cloned(), self.max_turns);
        let query = request.query.trim();
        let top_k = request.top_k.unwrap_or(self.default_top_k).max(1);

        trace.advance(TurnState::Searching);
        let mut semantic_parts = history.recent_user_queries(self.history_turns);
        semantic_parts.push(query);
        let semantic_text = semantic_parts.join(" ");

        let outcome = self
            .planner
            .search(query, Some(&semantic_text), &request.filters, top_k)
            .await;

        if outcome.unavailable() {
            trace.advance(TurnState::Error);
            tracing::warn!("both retrieval paths failed; turn not appended");
            let response = QueryResponse {
                answer: UNAVAILABLE_ANSWER.to_string(),
                conversation_history: request.conversation_history.clone(),
                results: Vec::new(),
                status: QueryStatus::Unavailable,
                degraded: outcome.degraded.iter().map(|p| p.to_string()).collect(),
            };
            return (response, trace);
        }

        let status = if outcome.results.is_empty() {
            trace.advance(TurnState::NoResults);
            QueryStatus::NoResults
        } else {
            trace.advance(TurnState::FoundResults);
            QueryStatus::FoundResults
        };

        let mut degraded: Vec<String> = outcome.degraded.iter().map(|p| p.to_string()).collect();
        let prior = history.to_vec();
        let ctx = AnswerContext {
            query,
            history: &prior,
            results: &outcome.results,
        };

        let answer = match with_retry("answer generation", &self.generator_policy, || {
            self.generator.generate(&ctx)
        })
        .await
        {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(
                    generator = self.generator.name(),
                    error = %format!("{:#}", e),
                    "answer generator failed; using template answer"
                );
                degraded.push("generator".to_string());
                self.fallback
                    .generate(&ctx)
                    .await
                    .unwrap_or_else(|_| crate::generator::format_results(&outcome.results))
            }
        };
        trace.advance(TurnState::ResponseGenerated);

        history.push(ConversationTurn::user(query));
        history.push(ConversationTurn::assistant(answer.clone()));
        trace.advance(TurnState::Appended);

        let response = QueryResponse {
            answer,
            conversation_history: history.to_vec(),
            results: outcome.results.iter().map(ResultSummary::from).collect(),
            status,
            degraded,
        };
        (response, trace)
    }
}
