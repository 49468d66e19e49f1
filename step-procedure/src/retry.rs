use log::{debug, warn};
use std::fmt;
use std::time::Duration;

/// Delay schedule of a [`RetryRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry
    Constant(Duration),
    /// Delay doubles with every retry starting at `initial`, never above `max`
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay before the given retry (1-indexed)
    pub fn delay_for(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Constant(d) => d,
            Backoff::Exponential { initial, max } => {
                let mut delay = initial;
                for _ in 1..retry {
                    if delay >= max {
                        break;
                    }
                    delay = delay.saturating_mul(2);
                }
                delay.min(max)
            }
        }
    }
}

/// Verdict of a [`RetryPolicy`] for one error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Rule `rule` allows retry number `attempt` after `delay`
    Retry {
        rule: String,
        attempt: u32,
        delay: Duration,
    },
    /// Rule `rule` matched but its budget of `max_retries` is spent
    Exhausted { rule: String, max_retries: u32 },
    /// No rule matched
    Fatal,
}

impl RetryDecision {
    pub fn should_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }

    /// Delay before retrying, zero when not retrying
    pub fn delay(&self) -> Duration {
        match self {
            RetryDecision::Retry { delay, .. } => *delay,
            _ => Duration::ZERO,
        }
    }
}

type Matcher<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

/// One clause of a [`RetryPolicy`]: a predicate over errors plus a back-off.
///
/// The rule counts how often it matched. A budget of `0` means unbounded; any
/// other budget allows exactly that many retries, after which the rule keeps
/// matching but refuses, for as long as it lives.
pub struct RetryRule<E> {
    name: String,
    matcher: Matcher<E>,
    backoff: Backoff,
    max_retries: u32,
    consultations: u32,
}

impl<E> RetryRule<E> {
    pub fn new(
        name: impl Into<String>,
        matcher: impl Fn(&E) -> bool + Send + Sync + 'static,
        backoff: Backoff,
        max_retries: u32,
    ) -> Self {
        Self {
            name: name.into(),
            matcher: Box::new(matcher),
            backoff,
            max_retries,
            consultations: 0,
        }
    }

    pub fn constant(
        name: impl Into<String>,
        matcher: impl Fn(&E) -> bool + Send + Sync + 'static,
        delay: Duration,
        max_retries: u32,
    ) -> Self {
        Self::new(name, matcher, Backoff::Constant(delay), max_retries)
    }

    pub fn exponential(
        name: impl Into<String>,
        matcher: impl Fn(&E) -> bool + Send + Sync + 'static,
        initial: Duration,
        max: Duration,
        max_retries: u32,
    ) -> Self {
        Self::new(
            name,
            matcher,
            Backoff::Exponential { initial, max },
            max_retries,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Number of times this rule matched an error
    pub fn consultations(&self) -> u32 {
        self.consultations
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_retries == 0
    }

    pub fn is_exhausted(&self) -> bool {
        !self.is_unbounded() && self.consultations >= self.max_retries
    }

    pub fn matches(&self, error: &E) -> bool {
        (self.matcher)(error)
    }

    /// Consult the rule. `None` when the predicate does not match.
    pub fn consult(&mut self, error: &E) -> Option<RetryDecision> {
        if !self.matches(error) {
            return None;
        }
        self.consultations = self.consultations.saturating_add(1);

        if self.is_unbounded() || self.consultations <= self.max_retries {
            let delay = self.backoff.delay_for(self.consultations);
            debug!(
                "Retry {} for rule '{}' with {:?} backoff",
                self.consultations, self.name, delay
            );
            Some(RetryDecision::Retry {
                rule: self.name.clone(),
                attempt: self.consultations,
                delay,
            })
        } else {
            warn!(
                "Retries for rule '{}' exhausted ({})",
                self.name, self.max_retries
            );
            Some(RetryDecision::Exhausted {
                rule: self.name.clone(),
                max_retries: self.max_retries,
            })
        }
    }
}

impl<E> fmt::Debug for RetryRule<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryRule")
            .field("name", &self.name)
            .field("backoff", &self.backoff)
            .field("max_retries", &self.max_retries)
            .field("consultations", &self.consultations)
            .finish()
    }
}

/// Ordered list of [`RetryRule`]s, first match wins.
///
/// The first rule whose predicate matches decides, including when it refuses
/// because its budget is spent. An error no rule matches is fatal.
pub struct RetryPolicy<E> {
    rules: Vec<RetryRule<E>>,
}

impl<E> Default for RetryPolicy<E> {
    fn default() -> Self {
        Self { rules: Vec::new() }
    }
}

impl<E> RetryPolicy<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: RetryRule<E>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Append a rule after the existing ones
    pub fn push(&mut self, rule: RetryRule<E>) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[RetryRule<E>] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&RetryRule<E>> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Classify `error` by the first rule whose predicate matches.
    ///
    /// That rule decides even when its budget is spent: the result is then
    /// [`RetryDecision::Exhausted`] and later matching rules are not consulted.
    pub fn decide(&mut self, error: &E) -> RetryDecision {
        self.rules
            .iter_mut()
            .find_map(|r| r.consult(error))
            .unwrap_or(RetryDecision::Fatal)
    }

    /// `(retry, delay)` for `error`; `(false, 0)` when nothing matches
    pub fn should_retry(&mut self, error: &E) -> (bool, Duration) {
        let d = self.decide(error);
        (d.should_retry(), d.delay())
    }
}

impl<E> Extend<RetryRule<E>> for RetryPolicy<E> {
    fn extend<T: IntoIterator<Item = RetryRule<E>>>(&mut self, iter: T) {
        self.rules.extend(iter);
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.rules).finish()
    }
}
