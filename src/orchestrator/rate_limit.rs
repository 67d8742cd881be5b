//! Per-user sliding-window execution counter.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Result, SandboxError};

/// Admits at most `limit` executions per user in any `window`.
///
/// Users whose window has emptied are dropped, so memory follows the set
/// of recently active users.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    state: Mutex<Windows>,
}

#[derive(Debug)]
struct Windows {
    users: HashMap<String, VecDeque<Instant>>,
    last_prune: Instant,
}

impl Windows {
    /// Drop every user with no hit inside `window`.
    fn prune(&mut self, now: Instant, window: Duration) {
        self.users
            .retain(|_, hits| hits.back().is_some_and(|t| now.duration_since(*t) < window));
        self.last_prune = now;
    }
}

impl RateLimiter {
    /// `limit` executions per user per sliding hour.
    pub fn per_hour(limit: usize) -> Self {
        Self::with_window(limit, Duration::from_secs(3600))
    }

    /// `limit` executions per user per `window`.
    pub fn with_window(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(Windows {
                users: HashMap::new(),
                last_prune: Instant::now(),
            }),
        }
    }

    /// Configured ceiling.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Admit one execution for `user_id` and return how many remain in the
    /// window, or fail with [`SandboxError::RateLimitExceeded`] without
    /// recording it.
    pub fn check(&self, user_id: &str) -> Result<usize> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if now.duration_since(state.last_prune) >= self.window {
            state.prune(now, self.window);
        }

        let used = match state.users.get_mut(user_id) {
            Some(hits) => {
                while hits
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    hits.pop_front();
                }
                hits.len()
            }
            None => 0,
        };

        if used >= self.limit {
            if used == 0 {
                state.users.remove(user_id);
            }
            tracing::warn!(user_id, limit = self.limit, "rate limit exceeded");
            return Err(SandboxError::RateLimitExceeded { limit: self.limit });
        }

        state
            .users
            .entry(user_id.to_string())
            .or_default()
            .push_back(now);
        Ok(self.limit - used - 1)
    }
}
