//! Prompt Builder System
//!
//! Standardized prompt construction for the pipeline stages. Stage 2 and
//! stage 3 prompts embed prior-stage outputs; stage 1 sends the caller's
//! prompt verbatim.
//!
//! ## Design Principles
//!
//! 1. **Role Definition**: Clear role for each stage
//! 2. **Structured Objectives**: Numbered goals
//! 3. **Context Sections**: Prior outputs, labelled by model
//! 4. **Focus Enforcement**: Answer the original question, not the peers

use std::collections::BTreeMap;

/// Prompt section types
#[derive(Debug, Clone)]
pub enum PromptSection {
    /// Role definition with expertise area
    Role { expertise: String, task: String },
    /// Numbered objectives
    Objectives(Vec<String>),
    /// Context with key-value pairs (sorted for reproducible prompts)
    Context(BTreeMap<String, String>),
    /// Raw text section with optional header
    Text {
        header: Option<String>,
        content: String,
    },
    /// One prior-stage answer, delimited so models can tell them apart
    Response { label: String, content: String },
    /// Focus enforcement with restrictions
    Focus {
        target: String,
        restrictions: Vec<String>,
    },
}

/// Prompt builder for consistent prompt construction
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    sections: Vec<PromptSection>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a role definition section
    pub fn role(mut self, expertise: &str, task: &str) -> Self {
        self.sections.push(PromptSection::Role {
            expertise: expertise.to_string(),
            task: task.to_string(),
        });
        self
    }

    /// Add objectives section
    pub fn objectives(mut self, objectives: Vec<&str>) -> Self {
        self.sections.push(PromptSection::Objectives(
            objectives.into_iter().map(String::from).collect(),
        ));
        self
    }

    /// Add a context item, merging into the first context section
    pub fn context_item(mut self, key: &str, value: &str) -> Self {
        let existing = self.sections.iter_mut().find_map(|section| match section {
            PromptSection::Context(ctx) => Some(ctx),
            _ => None,
        });
        match existing {
            Some(ctx) => {
                ctx.insert(key.to_string(), value.to_string());
            }
            None => {
                let mut ctx = BTreeMap::new();
                ctx.insert(key.to_string(), value.to_string());
                self.sections.push(PromptSection::Context(ctx));
            }
        }
        self
    }

    /// Add text section with header
    pub fn section(mut self, header: &str, content: &str) -> Self {
        self.sections.push(PromptSection::Text {
            header: Some(header.to_string()),
            content: content.to_string(),
        });
        self
    }

    pub fn response(mut self, label: &str, content: &str) -> Self {
        self.sections.push(PromptSection::Response {
            label: label.to_string(),
            content: content.to_string(),
        });
        self
    }

    /// Add focus enforcement section
    pub fn focus(mut self, target: &str, restrictions: Vec<&str>) -> Self {
        self.sections.push(PromptSection::Focus {
            target: target.to_string(),
            restrictions: restrictions.into_iter().map(String::from).collect(),
        });
        self
    }

    /// Build the final prompt string
    pub fn build(self) -> String {
        let mut prompt = String::new();

        for section in self.sections {
            match section {
                PromptSection::Role { expertise, task } => {
                    prompt.push_str("<ROLE>\n");
                    prompt.push_str(&format!(
                        "You are an expert {} specializing in {}.\n",
                        expertise, task
                    ));
                    prompt.push_str("</ROLE>\n\n");
                }
                PromptSection::Objectives(objectives) => {
                    prompt.push_str("<OBJECTIVES>\n");
                    for (i, obj) in objectives.iter().enumerate() {
                        prompt.push_str(&format!("{}. {}\n", i + 1, obj));
                    }
                    prompt.push_str("</OBJECTIVES>\n\n");
                }
                PromptSection::Context(ctx) => {
                    prompt.push_str("# Context\n\n");
                    for (key, value) in ctx {
                        prompt.push_str(&format!("**{}**: {}\n", key, value));
                    }
                    prompt.push('\n');
                }
                PromptSection::Text { header, content } => {
                    if let Some(h) = header {
                        prompt.push_str(&format!("# {}\n\n", h));
                    }
                    prompt.push_str(&content);
                    prompt.push_str("\n\n");
                }
                PromptSection::Response { label, content } => {
                    prompt.push_str(&format!("<RESPONSE model=\"{}\">\n", label));
                    prompt.push_str(content.trim());
                    prompt.push_str("\n</RESPONSE>\n\n");
                }
                PromptSection::Focus {
                    target,
                    restrictions,
                } => {
                    prompt.push_str("<FOCUS>\n");
                    prompt.push_str(&format!("IMPORTANT: Focus EXCLUSIVELY on: {}\n", target));
                    for restriction in restrictions {
                        prompt.push_str(&format!("- {}\n", restriction));
                    }
                    prompt.push_str("</FOCUS>\n\n");
                }
            }
        }

        prompt.trim_end().to_string()
    }
}

/// Preset prompt templates for the pipeline stages
pub struct PromptTemplates;

impl PromptTemplates {
    /// Stage 2: revise `own_answer` in light of the other models' answers.
    /// `peers` must not include the model being prompted.
    pub fn peer_review(original_prompt: &str, own_answer: &str, peers: &[(&str, &str)]) -> String {
        let mut builder = PromptBuilder::new()
            .role("reviewer", "critically revising answers against peer feedback")
            .objectives(vec![
                "Compare your original answer with the peer answers below",
                "Correct any errors the peers expose in your answer",
                "Adopt points the peers make that your answer missed",
                "Return only your revised, complete answer",
            ])
            .section("Original Question", original_prompt)
            .section("Your Original Answer", own_answer);

        if !peers.is_empty() {
            builder = builder.section("Peer Answers", "Answers from other models:");
            for (model, answer) in peers {
                builder = builder.response(model, answer);
            }
        }

        builder
            .focus(
                "answering the original question",
                vec![
                    "Do NOT describe the review process",
                    "Do NOT refer to the peers by name",
                ],
            )
            .build()
    }

    /// Stage 3: merge every revised answer into one final response
    pub fn ultra_synthesis(original_prompt: &str, answers: &[(&str, &str)]) -> String {
        let mut builder = PromptBuilder::new()
            .role("editor", "synthesizing multiple expert answers into one")
            .objectives(vec![
                "Merge the strongest points of every answer below",
                "Resolve contradictions, preferring the best-supported claim",
                "Produce a single coherent answer to the original question",
            ])
            .context_item("Answers", &answers.len().to_string())
            .section("Original Question", original_prompt);

        for (model, answer) in answers {
            builder = builder.response(model, answer);
        }

        builder
            .focus(
                "the original question",
                vec![
                    "Do NOT mention that multiple answers were combined",
                    "Do NOT add information none of the answers support",
                ],
            )
            .build()
    }
}
