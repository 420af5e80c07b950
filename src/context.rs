use serde::{Deserialize, Serialize};

use crate::message::{Turn, TurnRole};

const DIGEST_CHARS: usize = 60;

/// How an agent trims a long conversation before it reaches the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// Keep the latest request and fill the rest with the newest turns.
    #[default]
    Smart,
    /// Keep the earliest turns.
    TrimLast,
    /// Keep the newest turns.
    TrimFirst,
    /// Keep both ends and replace the middle with a digest.
    Summarize,
    /// Keep both ends.
    FirstLast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextPolicy {
    #[serde(default)]
    pub auto_manage: bool,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default)]
    pub strategy: ContextStrategy,
}

fn default_max_messages() -> usize {
    20
}

impl Default for ContextPolicy {
    fn default() -> Self {
        Self {
            auto_manage: false,
            max_messages: default_max_messages(),
            strategy: ContextStrategy::default(),
        }
    }
}

impl ContextPolicy {
    pub fn managed(max_messages: usize, strategy: ContextStrategy) -> Self {
        Self {
            auto_manage: true,
            max_messages: max_messages.max(1),
            strategy,
        }
    }

    /// The slice of `turns` the model should see.
    pub fn apply(&self, turns: &[Turn]) -> Vec<Turn> {
        let max = self.max_messages.max(1);
        if !self.auto_manage || turns.len() <= max {
            return turns.to_vec();
        }

        match self.strategy {
            ContextStrategy::TrimFirst => turns[turns.len() - max..].to_vec(),
            ContextStrategy::TrimLast => turns[..max].to_vec(),
            ContextStrategy::FirstLast => {
                let keep_first = max / 2;
                let keep_last = max - keep_first;
                let mut kept = turns[..keep_first].to_vec();
                kept.extend_from_slice(&turns[turns.len() - keep_last..]);
                kept
            }
            ContextStrategy::Summarize => {
                if max < 3 {
                    return turns[turns.len() - max..].to_vec();
                }
                let keep_first = (max - 1) / 2;
                let keep_last = max - 1 - keep_first;
                let middle = &turns[keep_first..turns.len() - keep_last];
                let mut kept = turns[..keep_first].to_vec();
                kept.push(digest(middle));
                kept.extend_from_slice(&turns[turns.len() - keep_last..]);
                kept
            }
            ContextStrategy::Smart => smart_window(turns, max),
        }
    }
}

fn smart_window(turns: &[Turn], max: usize) -> Vec<Turn> {
    let anchor = turns.iter().rposition(|t| t.role == TurnRole::User);
    let mut picked: Vec<usize> = Vec::with_capacity(max);
    if let Some(idx) = anchor {
        picked.push(idx);
    }
    for idx in (0..turns.len()).rev() {
        if picked.len() >= max {
            break;
        }
        if Some(idx) != anchor {
            picked.push(idx);
        }
    }
    picked.sort_unstable();
    picked.into_iter().map(|idx| turns[idx].clone()).collect()
}

fn digest(turns: &[Turn]) -> Turn {
    let lines: Vec<String> = turns
        .iter()
        .map(|turn| {
            let mut text: String = turn.content.chars().take(DIGEST_CHARS).collect();
            if turn.content.chars().count() > DIGEST_CHARS {
                text.push('…');
            }
            format!("{:?}: {text}", turn.role)
        })
        .collect();
    Turn::notice(format!(
        "[Summary of {} earlier turns]: {}",
        turns.len(),
        lines.join(" | ")
    ))
}
