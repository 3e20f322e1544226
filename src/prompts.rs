//! Prompt construction for all deliberation stages.
//!
//! Templates use `{key}` placeholders filled by [`render`]. Anonymity is a
//! safety invariant, not a presentation detail: any prompt sent to a peer or
//! to the chairman contains only anonymous labels (`Response A`,
//! `Evaluator 1`, `Participant B`), never a real model identifier. The only
//! place identities are unmasked is the arena moderator's identity-reveal
//! block, because the moderator is a terminal node that queries no peers.

use crate::deliberation::{MemberRanking, MemberResponse, Round};
use crate::labels::response_label;
use std::collections::BTreeMap;

/// Substitute `{key}` placeholders in a template.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in vars {
        rendered = rendered.replace(&format!("{{{}}}", key), value);
    }
    rendered
}

/// System prompt for council stage 1: answer critically, not agreeably.
pub const STAGE1_SYSTEM_PROMPT: &str = "\
You are a council member providing your honest assessment. Your role is to give a direct, accurate answer - not to please or validate the user.

GUIDELINES:
- If the question contains a flawed premise, point it out before answering
- If you're uncertain, say so explicitly rather than bluffing
- If the answer is \"it depends\" or \"we don't know,\" explain why
- Push back on bad ideas, incorrect assumptions, or poor reasoning
- Be specific about tradeoffs, limitations, and edge cases
- Avoid generic, hedging, or diplomatic non-answers

Your response will be evaluated by your peers. Quality and honesty matter more than agreeableness.";

const STAGE1_CONTEXT_TEMPLATE: &str = "\
The following context has been gathered to help answer the user's question:

{context}

---

User's Question: {query}

Please use the context above as reference when answering. Cite sources where appropriate.";

/// Stage-1 user prompt: the question, optionally preceded by combined
/// context (prior-conversation preface, attachment extracts, web results).
pub fn stage1_user_prompt(query: &str, context: Option<&str>) -> String {
    match context {
        Some(context) if !context.trim().is_empty() => render(
            STAGE1_CONTEXT_TEMPLATE,
            &[("context", context), ("query", query)],
        ),
        _ => query.to_string(),
    }
}

const RANKING_TEMPLATE: &str = "\
You are a rigorous evaluator assessing responses to the following question:

Question: {query}

Here are the responses from different models (anonymized):

{responses}

EVALUATION CRITERIA - Be ruthlessly honest:
- Accuracy: Are there factual errors, unsupported claims, or logical fallacies?
- Completeness: Does it actually answer the question, or dodge/deflect?
- Depth: Is the reasoning superficial or substantive?
- Honesty: Does it acknowledge uncertainty, or pretend to know what it doesn't?
- Usefulness: Would this actually help someone, or is it generic filler?

Your task:
1. Critically evaluate each response. Call out specific flaws, errors, and weaknesses. Don't be kind - be accurate.
2. Note what each response does well, if anything.
3. Provide a final ranking based on actual quality, not politeness.

IMPORTANT: Your final ranking MUST be formatted EXACTLY as follows:
- Start with the line \"FINAL RANKING:\" (all caps, with colon)
- Then list the responses from best to worst as a numbered list
- Each line should be: number, period, space, then ONLY the response label (e.g., \"1. Response A\")
- Do not add any other text or explanations in the ranking section

Example format:

Response A contains a factual error about X and fails to address Y...
Response B provides accurate information but is too vague on Z...
Response C is the most thorough but overstates confidence in its claims...

FINAL RANKING:
1. Response C
2. Response B
3. Response A

Now provide your critical evaluation and ranking:";

/// Stage-2 prompt: the question plus every stage-1 answer in label order.
pub fn ranking_prompt(query: &str, stage1: &[MemberResponse]) -> String {
    let responses = stage1
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}:\n{}", response_label(i), r.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    render(RANKING_TEMPLATE, &[("query", query), ("responses", &responses)])
}

const CHAIRMAN_TEMPLATE: &str = "\
You are the Chairman of an LLM Council tasked with delivering the TRUTH, not consensus.

Original Question: {query}

STAGE 1 - Individual Responses (anonymized):
{stage1}

STAGE 2 - Peer Rankings (anonymized evaluators):
{stage2}

YOUR MANDATE AS CHAIRMAN:
You are not here to please the user or validate their assumptions. You are here to provide the most accurate, honest answer possible.

CRITICAL EVALUATION:
1. Identify where the council AGREES - but agreement doesn't mean correctness. Consensus around a wrong answer is still wrong.
2. Identify where the council DISAGREES - genuine disagreement often reveals important nuance or uncertainty.
3. Look for ERRORS - factual mistakes, logical fallacies, unsupported claims, or wishful thinking.
4. Consider what's MISSING - what did the models fail to address or conveniently ignore?

YOUR RESPONSE MUST:
- Correct any errors in the council's responses, even if highly-ranked responses made them
- Push back on flawed reasoning, bad ideas, or incorrect assumptions - including from the user's original question
- Acknowledge genuine uncertainty rather than pretending to know things you don't
- Be direct and honest, not diplomatic and evasive
- Prioritize accuracy over being agreeable

If the user's premise is flawed, say so. If a popular answer is wrong, explain why. If there's no good answer, admit it.

Now provide your synthesis - the truth as best you can determine it:";

/// Stage-3 chairman prompt. Responses appear as `Response <label>` and
/// critiques as `Evaluator <n>`; no model identifier reaches the chairman.
pub fn chairman_prompt(
    query: &str,
    stage1: &[MemberResponse],
    stage2: &[MemberRanking],
) -> String {
    let stage1_text = stage1
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}:\n{}", response_label(i), r.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    let stage2_text = stage2
        .iter()
        .enumerate()
        .map(|(i, r)| format!("Evaluator {}:\n{}", i + 1, r.critique))
        .collect::<Vec<_>>()
        .join("\n\n");

    render(
        CHAIRMAN_TEMPLATE,
        &[("query", query), ("stage1", &stage1_text), ("stage2", &stage2_text)],
    )
}

const ARENA_OPENING_TEMPLATE: &str = "\
You are {label} in a multi-round debate among AI participants.

Question: {query}
{web_section}
Provide your initial position on this question. Be clear, well-reasoned, and thorough.

Other participants will see your response and may challenge, refine, or build upon it in subsequent rounds. This is Round 1 of {total_rounds}.

Your response:";

/// Arena round-1 prompt for one participant.
pub fn arena_opening_prompt(
    label: &str,
    query: &str,
    total_rounds: u32,
    web_context: Option<&str>,
) -> String {
    let web_section = match web_context {
        Some(ctx) if !ctx.trim().is_empty() => {
            format!("\nThe following web search results may be helpful:\n{}\n", ctx)
        }
        _ => String::new(),
    };
    render(
        ARENA_OPENING_TEMPLATE,
        &[
            ("label", label),
            ("query", query),
            ("web_section", &web_section),
            ("total_rounds", &total_rounds.to_string()),
        ],
    )
}

const ARENA_REBUTTAL_TEMPLATE: &str = "\
You are {label} in Round {round_number} of {total_rounds} of a multi-round debate.

Original Question: {query}

=== Previous Discussion ===
{transcript}
=== End Previous Discussion ===

This is a deliberation round. Having reviewed all previous positions, you should:
- **REBUT**: Challenge arguments you disagree with, citing specific points
- **REFINE**: Improve upon your own position or others' valid points
- **CONCEDE**: Acknowledge where others made stronger arguments
- **STRENGTHEN**: Provide additional evidence or reasoning for positions you support

Be specific about which participant(s) you're responding to. Maintain intellectual honesty.
Focus on the most substantive points of agreement or disagreement.

Your deliberation:";

/// Arena rebuttal prompt for one participant.
pub fn arena_rebuttal_prompt(
    label: &str,
    query: &str,
    round_number: u32,
    total_rounds: u32,
    transcript: &str,
) -> String {
    render(
        ARENA_REBUTTAL_TEMPLATE,
        &[
            ("label", label),
            ("query", query),
            ("round_number", &round_number.to_string()),
            ("total_rounds", &total_rounds.to_string()),
            ("transcript", transcript),
        ],
    )
}

const ARENA_SYNTHESIS_TEMPLATE: &str = "\
You are the moderator synthesizing a multi-round debate among AI participants.

Original Question: {query}

=== Complete Debate Transcript ===
{transcript}
=== End Transcript ===

=== Participant Identities ===
{identity_reveal}
=== End Identities ===

Synthesize this debate into a comprehensive final answer. Your synthesis MUST include these sections:

## Consensus Points
Areas where participants converged or agreed. What did they collectively establish as true or valid?

## Complete Answer
The best answer to the original question, incorporating the strongest insights from all rounds. This should be a thorough, well-reasoned response that a user would find valuable.

## Unresolved Dissents
Points of genuine disagreement that remain after deliberation. Why do these disagreements persist? What would need to be known to resolve them?

Provide a comprehensive, well-structured response:";

/// Moderator prompt: full transcript plus the identity reveal. The reveal
/// is permitted here only; the moderator is terminal.
pub fn arena_synthesis_prompt(
    query: &str,
    rounds: &[Round],
    participant_mapping: &BTreeMap<String, String>,
) -> String {
    render(
        ARENA_SYNTHESIS_TEMPLATE,
        &[
            ("query", query),
            ("transcript", &format_transcript(rounds)),
            ("identity_reveal", &identity_reveal(participant_mapping)),
        ],
    )
}

/// Format prior rounds for inclusion in rebuttal and synthesis prompts.
pub fn format_transcript(rounds: &[Round]) -> String {
    let mut parts = Vec::new();
    for round in rounds {
        let kind = round.round_type.to_string();
        let mut title: Vec<char> = kind.chars().collect();
        if let Some(first) = title.first_mut() {
            *first = first.to_ascii_uppercase();
        }
        parts.push(format!(
            "--- Round {} ({}) ---",
            round.round_number,
            title.into_iter().collect::<String>()
        ));
        for response in &round.responses {
            parts.push(format!("\n{}:\n{}\n", response.participant, response.content));
        }
    }
    parts.join("\n")
}

/// Format the participant → model mapping for the moderator.
pub fn identity_reveal(mapping: &BTreeMap<String, String>) -> String {
    mapping
        .iter()
        .map(|(label, model)| {
            let short = model.split('/').nth(1).unwrap_or(model);
            format!("- {}: {} ({})", label, short, model)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

const TITLE_TEMPLATE: &str = "\
Generate a very short title (3-5 words maximum) that summarizes the following question.
The title should be concise and descriptive. Do not use quotes or punctuation in the title.

Question: {query}

Title:";

/// Prompt for the first-message title-generation call.
pub fn title_prompt(query: &str) -> String {
    render(TITLE_TEMPLATE, &[("query", query)])
}

const PRIOR_CONTEXT_TEMPLATE: &str = "\
## Prior Conversation Context

The user previously asked: {original_question}

The council's synthesized answer was:

{synthesis}

---

";

/// Preface carrying context forked from an earlier conversation.
pub fn prior_context_preface(original_question: &str, synthesis: &str) -> String {
    render(
        PRIOR_CONTEXT_TEMPLATE,
        &[("original_question", original_question), ("synthesis", synthesis)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deliberation::{ParticipantResponse, RoundType};

    fn member(model: &str, content: &str) -> MemberResponse {
        MemberResponse {
            model: model.into(),
            content: content.into(),
            metrics: None,
            reasoning_details: None,
        }
    }

    fn ranking(model: &str, critique: &str) -> MemberRanking {
        MemberRanking {
            model: model.into(),
            critique: critique.into(),
            parsed_ranking: vec![],
            metrics: None,
            reasoning_details: None,
        }
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        assert_eq!(render("Hello {name}", &[("name", "World")]), "Hello World");
    }

    #[test]
    fn test_stage1_prompt_without_context_is_bare_query() {
        assert_eq!(stage1_user_prompt("What is 2+2?", None), "What is 2+2?");
        assert_eq!(stage1_user_prompt("What is 2+2?", Some("  ")), "What is 2+2?");
    }

    #[test]
    fn test_stage1_prompt_prepends_context() {
        let prompt = stage1_user_prompt("What is 2+2?", Some("## Attached Documents\n\nnotes"));
        assert!(prompt.contains("## Attached Documents"));
        assert!(prompt.contains("User's Question: What is 2+2?"));
        assert!(prompt.find("notes").unwrap() < prompt.find("What is 2+2?").unwrap());
    }

    #[test]
    fn test_ranking_prompt_labels_in_order() {
        let stage1 = vec![member("m/a", "first answer"), member("m/b", "second answer")];
        let prompt = ranking_prompt("Q?", &stage1);
        assert!(prompt.contains("Response A:\nfirst answer"));
        assert!(prompt.contains("Response B:\nsecond answer"));
        assert!(prompt.contains("FINAL RANKING:"));
    }

    #[test]
    fn test_ranking_prompt_hides_model_ids() {
        let stage1 = vec![member("openai/gpt-5.1", "a"), member("x-ai/grok-4", "b")];
        let prompt = ranking_prompt("Q?", &stage1);
        assert!(!prompt.contains("openai/gpt-5.1"));
        assert!(!prompt.contains("x-ai/grok-4"));
    }

    #[test]
    fn test_chairman_prompt_contains_no_model_identifiers() {
        let stage1 = vec![
            member("openai/gpt-5.1", "answer one"),
            member("anthropic/claude-sonnet-4.5", "answer two"),
        ];
        let stage2 = vec![
            ranking("openai/gpt-5.1", "critique\nFINAL RANKING:\n1. Response B\n2. Response A"),
            ranking("anthropic/claude-sonnet-4.5", "critique two"),
        ];

        let prompt = chairman_prompt("Q?", &stage1, &stage2);
        assert!(!prompt.contains("openai/gpt-5.1"));
        assert!(!prompt.contains("anthropic/claude-sonnet-4.5"));
        assert!(prompt.contains("Response A:\nanswer one"));
        assert!(prompt.contains("Evaluator 1:"));
        assert!(prompt.contains("Evaluator 2:"));
    }

    #[test]
    fn test_arena_opening_prompt() {
        let prompt = arena_opening_prompt("Participant A", "Q?", 3, None);
        assert!(prompt.contains("You are Participant A"));
        assert!(prompt.contains("Round 1 of 3"));
        assert!(!prompt.contains("web search results"));

        let with_web = arena_opening_prompt("Participant A", "Q?", 3, Some("results here"));
        assert!(with_web.contains("web search results"));
    }

    #[test]
    fn test_rebuttal_prompt_carries_transcript() {
        let prompt = arena_rebuttal_prompt("Participant B", "Q?", 2, 3, "--- Round 1 ---");
        assert!(prompt.contains("Round 2 of 3"));
        assert!(prompt.contains("--- Round 1 ---"));
        assert!(prompt.contains("**REBUT**"));
    }

    #[test]
    fn test_transcript_format() {
        let rounds = vec![Round::new(
            1,
            RoundType::Opening,
            vec![ParticipantResponse {
                participant: "Participant A".into(),
                model: "m/a".into(),
                content: "my position".into(),
                metrics: None,
                reasoning_details: None,
                parsed_ranking: None,
            }],
        )];
        let transcript = format_transcript(&rounds);
        assert!(transcript.contains("--- Round 1 (Opening) ---"));
        assert!(transcript.contains("Participant A:\nmy position"));
        // Transcript shown to peers carries labels, not identities.
        assert!(!transcript.contains("m/a"));
    }

    #[test]
    fn test_identity_reveal_only_in_synthesis_prompt() {
        let mapping: BTreeMap<String, String> = [
            ("Participant A".to_string(), "openai/gpt-5.1".to_string()),
            ("Participant B".to_string(), "x-ai/grok-4".to_string()),
        ]
        .into();
        let rounds: Vec<Round> = vec![];

        let synthesis = arena_synthesis_prompt("Q?", &rounds, &mapping);
        assert!(synthesis.contains("- Participant A: gpt-5.1 (openai/gpt-5.1)"));
        assert!(synthesis.contains("- Participant B: grok-4 (x-ai/grok-4)"));

        let rebuttal = arena_rebuttal_prompt("Participant A", "Q?", 2, 3, "");
        assert!(!rebuttal.contains("openai/gpt-5.1"));
    }

    #[test]
    fn test_title_prompt_mentions_query() {
        let prompt = title_prompt("How do rockets work?");
        assert!(prompt.contains("How do rockets work?"));
        assert!(prompt.contains("3-5 words"));
    }

    #[test]
    fn test_prior_context_preface() {
        let preface = prior_context_preface("old question", "old synthesis");
        assert!(preface.contains("old question"));
        assert!(preface.contains("old synthesis"));
        assert!(preface.starts_with("## Prior Conversation Context"));
    }
}
