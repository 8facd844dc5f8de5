//! Prompt composer: system prompts, finalization prompts, failure-experience
//! injection.
//!
//! The tool-use preamble is contractual: the parser extracts exactly the
//! grammar promised here, so the two must never drift apart.

use chrono::NaiveDate;

use crate::mcp::ServerCatalog;

/// Role-specific objective of an orchestrator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    /// Top-level task-solving agent.
    Main,
    /// Nested web search-and-browse agent.
    Browsing,
}

impl AgentRole {
    pub fn agent_name(self) -> &'static str {
        match self {
            AgentRole::Main => "main",
            AgentRole::Browsing => "browser",
        }
    }
}

pub const FAILURE_EXPERIENCE_HEADER: &str = "\n=== Previous Attempts Analysis ===\nThe following summarizes what was tried before and why it didn't work. Use this to guide a NEW approach.\n\n";

pub const FAILURE_EXPERIENCE_FOOTER: &str =
    "=== End of Analysis ===\n\nBased on the above, you should try a different strategy this time.\n";

/// Post-mortem prompt sent when an attempt fails. Forbids tool use and asks
/// for the structured sections the next attempt is seeded with.
pub const FAILURE_SUMMARY_PROMPT: &str = "The task was not completed successfully. Do NOT call any tools. Provide a summary:\n\nFailure type: [incomplete / blocked / misdirected]\n  - incomplete: ran out of turns before finishing\n  - blocked: got stuck due to tool failure or missing information\n  - misdirected: went down the wrong path\nWhat happened: [describe the approach taken and why a final answer was not reached]\nUseful findings: [list any facts, intermediate results, or conclusions discovered that should be reused]";

/// Placeholder written over demoted tool results.
pub const OMITTED_TOOL_RESULT: &str = "Tool result is omitted to save tokens.";

/// Build the system prompt: tool-use protocol preamble, schema-rendered
/// catalog, role objective, current date. Retry attempts are prefixed with
/// experience on retry attempts.
pub fn system_prompt(
    date: NaiveDate,
    catalog: &[ServerCatalog],
    role: AgentRole,
    failure_experiences: &[String],
) -> String {
    let mut prompt = String::new();

    if !failure_experiences.is_empty() {
        prompt.push_str(&failure_experience_block(failure_experiences));
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "In this environment you have access to a set of tools you can use to answer the user's question.\n\n\
You only have access to the tools provided below. You can only use one tool per message, and will receive the result of that tool in the user's next response. You use tools step-by-step to accomplish a given task, with each tool-use informed by the result of the previous tool-use. Today is: {}\n\n",
        date.format("%Y-%m-%d")
    ));

    prompt.push_str(
        "# Tool-Use Formatting Instructions\n\n\
Tool-use is formatted using XML-style tags. The tool-use is enclosed in <use_mcp_tool></use_mcp_tool> and each parameter is similarly enclosed within its own set of tags.\n\n\
Parameters:\n\
- server_name: (required) The name of the MCP server providing the tool\n\
- tool_name: (required) The name of the tool to execute\n\
- arguments: (required) A JSON object containing the tool's input parameters, following the tool's input schema, quotes within string must be properly escaped, ensure it's valid JSON\n\n\
Usage:\n\
<use_mcp_tool>\n\
<server_name>server name here</server_name>\n\
<tool_name>tool name here</tool_name>\n\
<arguments>\n\
{\n\
\"param1\": \"value1\",\n\
\"param2\": \"value2 \\\"escaped string\\\"\"\n\
}\n\
</arguments>\n\
</use_mcp_tool>\n\n\
Important Notes:\n\
- Tool-use must be placed **at the end** of your response, **top-level**, and not nested within other tags.\n\
- Always adhere to this format for the tool use to ensure proper parsing and execution.\n\n\
String and scalar parameters should be specified as is, while lists and objects should use JSON format. Note that spaces for string values are not stripped. The output is not expected to be valid XML and is parsed with regular expressions.\n\
Here are the functions available in JSONSchema format:\n",
    );

    for server in catalog {
        prompt.push_str(&format!("\n## Server name: {}\n", server.server_name));
        for tool in &server.tools {
            prompt.push_str(&format!("### Tool name: {}\n", tool.name));
            if let Some(description) = &tool.description {
                prompt.push_str(&format!("Description: {}\n", description));
            }
            prompt.push_str(&format!(
                "Input JSON schema: {}\n",
                serde_json::to_string(&tool.input_schema).unwrap_or_default()
            ));
        }
    }

    prompt.push_str("\n# General Objective\n\nYou accomplish a given task iteratively, breaking it down into clear steps and working through them methodically.\n\n");
    prompt.push_str(role_objective(role));
    prompt
}

fn role_objective(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Main => {
            "# Agent Specific Objective\n\n\
You are a task-solving agent that uses tools step-by-step to gather information for the user's question.\n\n\
You are currently in the research phase, NOT the final answer phase. Search for relevant information, browse pages to extract facts, and decide what additional information is needed. Do NOT write final answers, summaries, or conclusions yet; you will be explicitly asked for a final summary later. Focus only on gathering comprehensive information."
        }
        AgentRole::Browsing => {
            "# Agent Specific Objective\n\n\
You are an agent that performs the task of searching and browsing the web for specific information and generating the desired answer. Your task is to retrieve reliable, factual, and verifiable information that fills in knowledge gaps.\n\
Do not infer, speculate, summarize broadly, or attempt to fill in missing parts yourself. Only return factual content."
        }
    }
}

/// Build the finalization prompt. It forbids further tool calls; the main
/// role must wrap its answer in the boxed sentinel, the browsing role
/// produces a structured report for its parent.
pub fn summary_prompt(task: &str, role: AgentRole) -> String {
    match role {
        AgentRole::Main => format!(
            "This is a direct instruction to you (the assistant), not the result of a tool call.\n\n\
The research phase is over. You must NOT initiate any further tool use. Your role has changed: you are now the user's advisor, presenting what the research found as a clear, human answer.\n\n\
The original question is repeated here for reference:\n\n\"{task}\"\n\n\
Answer the question directly from the information gathered above. Lead with the core answer, then supporting detail. Do not describe your research process, failed attempts, or tool mechanics, and do not output any tool tags. If some information could not be obtained, say so briefly and give the best answer the findings support.\n\n\
End your response with the final answer wrapped in the sentinel \\boxed{{...}}, for example: \\boxed{{42}}. The sentinel must appear exactly once."
        ),
        AgentRole::Browsing => format!(
            "This is a direct instruction to you (the assistant), not the result of a tool call.\n\n\
We are now ending this session, and your conversation history will be deleted. You must NOT initiate any further tool use. This is your final opportunity to report *all* of the information gathered during the session.\n\n\
The original task is repeated here for reference:\n\n\"{task}\"\n\n\
Summarize the above search and browsing history. Output the FINAL RESPONSE and detailed supporting information of the task given to you. If you found useful facts, data, quotes, or answers directly relevant to the original task, include them clearly and completely. If the task could not be fully answered, do NOT make up content; return all partially relevant findings instead, and clearly indicate partial, conflicting, or inconclusive information.\n\n\
Your final response should be a clear, complete, and structured report organized into logical sections. Do NOT include tool call instructions, speculative filler, or vague summaries."
        ),
    }
}

/// Render prior post-mortems into the injection block for a retry attempt.
pub fn failure_experience_block(experiences: &[String]) -> String {
    let mut block = String::from(FAILURE_EXPERIENCE_HEADER);
    for (idx, experience) in experiences.iter().enumerate() {
        block.push_str(&format!("[Attempt {}]\n{}\n\n", idx + 1, experience.trim()));
    }
    block.push_str(FAILURE_EXPERIENCE_FOOTER);
    block
}
