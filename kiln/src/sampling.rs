//! Repeat-penalty bookkeeping for sampling.
//!
//! Tracks the last N sampled tokens in a sliding window and maintains a
//! `[1, 1, vocab]` float32 penalty tensor: a token inside the window holds
//! the configured penalty value, one that has fully left the window reverts
//! to 1.0. The tensor feeds the RepeatPenalty operation before sampling.

use std::collections::{BTreeMap, VecDeque};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::tensor::Tensor;

pub struct TokenPenaltyManager {
    penalty: Tensor,
    counts: BTreeMap<i32, i32>,
    window: VecDeque<i32>,
    vocab_size: usize,
    last_n: usize,
    value: f32,
}

impl TokenPenaltyManager {
    /// # Errors
    /// Fails if the penalty tensor cannot be allocated.
    pub fn new(vocab_size: usize, last_n: usize, value: f32) -> Result<Self> {
        let mut mgr = Self {
            penalty: Tensor::new(DType::F32),
            counts: BTreeMap::new(),
            window: VecDeque::new(),
            vocab_size,
            last_n,
            value,
        };
        mgr.clear()?;
        Ok(mgr)
    }

    /// Forget the window and reset every penalty to 1.0.
    ///
    /// # Errors
    /// Fails if the penalty tensor cannot be reallocated.
    pub fn clear(&mut self) -> Result<()> {
        self.counts.clear();
        self.window.clear();
        let mut ones = Tensor::with_shape(DType::F32, &[1, 1, self.vocab_size]);
        ones.allocate_filled(1.0)?;
        self.penalty.copy_from(&ones)?;
        Ok(())
    }

    /// Record a sampled token, evicting the oldest once the window is full.
    ///
    /// # Errors
    /// Fails for a token id outside the vocabulary.
    pub fn insert_token(&mut self, token: i32) -> Result<()> {
        let slot = usize::try_from(token)
            .ok()
            .filter(|&i| i < self.vocab_size)
            .ok_or_else(|| {
                Error::InvalidShape(format!(
                    "token {token} outside vocabulary of {}",
                    self.vocab_size
                ))
            })?;

        if self.window.len() >= self.last_n {
            if let Some(evicted) = self.window.pop_front() {
                let count = self.counts.entry(evicted).or_insert(0);
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(&evicted);
                    self.penalty.as_f32_mut()?[evicted as usize] = 1.0;
                }
            }
        }

        self.window.push_back(token);
        let count = self.counts.entry(token).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.penalty.as_f32_mut()?[slot] = self.value;
        }
        Ok(())
    }

    #[must_use]
    pub fn penalty(&self) -> &Tensor {
        &self.penalty
    }

    pub fn penalty_mut(&mut self) -> &mut Tensor {
        &mut self.penalty
    }

    #[must_use]
    pub fn window_len(&self) -> usize {
        self.window.len()
    }
}
