//! Duplicate-query index.
//!
//! Per-task bookkeeping of the query strings each (agent, tool) pair has
//! already issued. Counts are recorded only after a call actually executes,
//! so a rolled-back duplicate does not inflate them.

use std::collections::HashMap;

use serde_json::Value;

/// Per-task index: `(agent, tool) → trimmed query → execution count`.
#[derive(Debug, Default)]
pub struct QueryIndex {
    counts: HashMap<(String, String), HashMap<String, usize>>,
}

impl QueryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Times this exact query has already executed for `(agent, tool)`.
    pub fn count(&self, agent: &str, tool: &str, query: &str) -> usize {
        self.counts
            .get(&(agent.to_string(), tool.to_string()))
            .and_then(|m| m.get(query.trim()))
            .copied()
            .unwrap_or(0)
    }

    /// Record an executed query; returns the new count.
    pub fn record(&mut self, agent: &str, tool: &str, query: &str) -> usize {
        let entry = self
            .counts
            .entry((agent.to_string(), tool.to_string()))
            .or_default()
            .entry(query.trim().to_string())
            .or_insert(0);
        *entry += 1;
        *entry
    }

    /// Total executed queries across the task (monotone non-decreasing).
    pub fn total(&self) -> usize {
        self.counts.values().flat_map(|m| m.values()).sum()
    }
}

/// Extract the dedup key for a tool call. Tools without a meaningful query
/// string are exempt from dedup.
pub fn query_key(tool_name: &str, arguments: &Value, sub_agent_tool: &str) -> Option<String> {
    let field = if tool_name == sub_agent_tool {
        arguments.get("subtask")
    } else if is_search_tool(tool_name) {
        arguments
            .get("q")
            .or_else(|| arguments.get("query"))
            .or_else(|| arguments.get("keyword"))
    } else if is_fetch_tool(tool_name) {
        arguments.get("url")
    } else {
        None
    };

    field
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn is_search_tool(tool_name: &str) -> bool {
    tool_name.contains("search")
}

pub fn is_fetch_tool(tool_name: &str) -> bool {
    tool_name.contains("scrape") || tool_name.contains("browse") || tool_name.contains("fetch")
}
