//! Template mutation operators.
//!
//! Every operator inserts a directive block just before the template's message
//! loop (or at the top when there is no loop). The block is wrapped in
//! `{% raw %}` so its text can never change the template's syntax, and in
//! `{% if tools %}` when the template already branches on tools. A mutation is
//! accepted only if the result renders the smoke-test conversation, shows the
//! directive in the output and reads the same context variables as its base.

use std::{fmt, str::FromStr};

use once_cell::sync::Lazy;
use rand::{rngs::StdRng, Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    render::{Renderer, TemplateSyntaxError},
    types::Conversation,
};

static RE_MESSAGE_LOOP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{%-?\s*for\s+\w+\s+in\s+messages\b").unwrap());

const INSTRUCTION_BLOCKS: &[&str] = &[
    "You have access to tools. When you need to use a tool, output it in this exact format:\n<tool_call={\"name\": \"tool_name\", \"arguments\": {\"arg\": \"value\"}}>",
    "Always output valid JSON for tool arguments.",
    "When you call a tool, reply with one JSON object per call of the form {\"name\": \"<tool name>\", \"arguments\": {...}} and use the parameter names exactly as they are defined.",
];

const WORKED_EXAMPLES: &[&str] = &[
    "Examples:\nUser: What's the weather in Tokyo?\nAssistant: <tool_call={\"name\": \"get_weather\", \"arguments\": {\"location\": \"Tokyo\"}}>",
    "Example:\nUser: What is 2 plus 2?\nAssistant: <tool_call={\"name\": \"calculate\", \"arguments\": {\"expression\": \"2 + 2\"}}>",
    "Example of a tool call and nothing else:\nUser: Find recent articles about Rust\nAssistant: <tool_call>{\"name\": \"web_search\", \"arguments\": {\"query\": \"recent articles about Rust\"}}</tool_call>",
];

const FORMAT_DIRECTIVES: &[&str] = &[
    "IMPORTANT: Tool calls must be in this exact format:\n<tool_call={\"name\": \"function_name\", \"arguments\": {\"key\": \"value\"}}>\nDo not include any other text when making a tool call.",
    "IMPORTANT: When you use a tool, your entire reply must be the call, exactly like:\n<tool_call>{\"name\": \"function_name\", \"arguments\": {\"key\": \"value\"}}</tool_call>\nNo explanations, no markdown.",
];

const TOOL_FIRST_DIRECTIVES: &[&str] = &[
    "When a tool is available that could help, always use it rather than answering directly.",
    "If one of the tools can answer the request, call it first. Only answer in prose after you have its result.",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationOperator {
    AddInstructionBlock,
    AddWorkedExample,
    #[serde(alias = "add-strict-format")]
    TightenOutputFormatDirective,
    ForceToolFirstOrdering,
    Compose(Box<MutationOperator>, Box<MutationOperator>),
}

impl MutationOperator {
    pub const PRIMITIVES: [MutationOperator; 4] = [
        MutationOperator::AddInstructionBlock,
        MutationOperator::AddWorkedExample,
        MutationOperator::TightenOutputFormatDirective,
        MutationOperator::ForceToolFirstOrdering,
    ];

    pub fn compose(first: MutationOperator, second: MutationOperator) -> Self {
        MutationOperator::Compose(Box::new(first), Box::new(second))
    }

    fn phrasings(&self) -> &'static [&'static str] {
        match self {
            MutationOperator::AddInstructionBlock => INSTRUCTION_BLOCKS,
            MutationOperator::AddWorkedExample => WORKED_EXAMPLES,
            MutationOperator::TightenOutputFormatDirective => FORMAT_DIRECTIVES,
            MutationOperator::ForceToolFirstOrdering => TOOL_FIRST_DIRECTIVES,
            MutationOperator::Compose(..) => &[],
        }
    }

    /// Primitive operator names, outermost composition flattened.
    pub fn primitive_names(&self) -> Vec<String> {
        match self {
            MutationOperator::Compose(first, second) => {
                let mut names = first.primitive_names();
                names.extend(second.primitive_names());
                names
            }
            other => vec![other.to_string()],
        }
    }
}

impl fmt::Display for MutationOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationOperator::AddInstructionBlock => f.write_str("add-instruction-block"),
            MutationOperator::AddWorkedExample => f.write_str("add-worked-example"),
            MutationOperator::TightenOutputFormatDirective => {
                f.write_str("tighten-output-format-directive")
            }
            MutationOperator::ForceToolFirstOrdering => f.write_str("force-tool-first-ordering"),
            MutationOperator::Compose(first, second) => write!(f, "compose({first}, {second})"),
        }
    }
}

impl FromStr for MutationOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(inner) = s.strip_prefix("compose(").and_then(|rest| rest.strip_suffix(')')) {
            let (first, second) = split_compose_arguments(inner)
                .ok_or_else(|| format!("compose needs two operators: '{s}'"))?;
            return Ok(MutationOperator::compose(first.parse()?, second.parse()?));
        }
        match s {
            "add-instruction-block" => Ok(MutationOperator::AddInstructionBlock),
            "add-worked-example" => Ok(MutationOperator::AddWorkedExample),
            "tighten-output-format-directive" | "add-strict-format" => {
                Ok(MutationOperator::TightenOutputFormatDirective)
            }
            "force-tool-first-ordering" => Ok(MutationOperator::ForceToolFirstOrdering),
            other => Err(format!("unknown mutation operator '{other}'")),
        }
    }
}

fn split_compose_arguments(inner: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    for (index, ch) in inner.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1)?,
            ',' if depth == 0 => return Some((&inner[..index], &inner[index + 1..])),
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvalidMutation {
    #[error("mutation left the template unchanged")]
    NoChange,

    #[error("mutated template does not render the smoke-test conversation: {0}")]
    RenderFailed(#[from] TemplateSyntaxError),

    #[error("inserted directive does not appear in the rendered prompt")]
    DirectiveNotRendered,

    #[error("mutation changed the template variables (added {added:?}, removed {removed:?})")]
    ContractChanged {
        added: Vec<String>,
        removed: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct MutationEngine {
    renderer: Renderer,
    smoke: Conversation,
}

impl Default for MutationEngine {
    fn default() -> Self {
        Self::new(Renderer::default())
    }
}

impl MutationEngine {
    pub fn new(renderer: Renderer) -> Self {
        Self {
            renderer,
            smoke: Conversation::smoke_test(),
        }
    }

    /// Deterministic for a given template, operator and seed.
    pub fn mutate(
        &self,
        template: &str,
        operator: &MutationOperator,
        seed: u64,
    ) -> Result<String, InvalidMutation> {
        let mutated = self.apply(template, operator, seed)?;
        self.validate(template, &mutated)?;
        Ok(mutated)
    }

    /// Picks a primitive operator, or with `compose_probability` a composition of two.
    pub fn random_operator(&self, rng: &mut StdRng, compose_probability: f64) -> MutationOperator {
        let pick = |rng: &mut StdRng| {
            MutationOperator::PRIMITIVES[rng.gen_range(0..MutationOperator::PRIMITIVES.len())].clone()
        };
        if rng.gen_bool(compose_probability.clamp(0.0, 1.0)) {
            let first = pick(rng);
            let second = pick(rng);
            MutationOperator::compose(first, second)
        } else {
            pick(rng)
        }
    }

    /// Checks that `candidate` renders the smoke-test conversation and reads the
    /// same context variables as `base`.
    pub fn validate(&self, base: &str, candidate: &str) -> Result<(), InvalidMutation> {
        if base == candidate {
            return Err(InvalidMutation::NoChange);
        }
        self.renderer.render_conversation(candidate, &self.smoke)?;

        let before = self.renderer.variable_contract(base)?;
        let after = self.renderer.variable_contract(candidate)?;
        if before != after {
            return Err(InvalidMutation::ContractChanged {
                added: after.difference(&before).cloned().collect(),
                removed: before.difference(&after).cloned().collect(),
            });
        }
        Ok(())
    }

    fn apply(
        &self,
        template: &str,
        operator: &MutationOperator,
        seed: u64,
    ) -> Result<String, InvalidMutation> {
        if let MutationOperator::Compose(first, second) = operator {
            let intermediate = self.apply(template, first, seed)?;
            return self.apply(&intermediate, second, seed.wrapping_add(1));
        }

        let phrasings = operator.phrasings();
        let mut rng = StdRng::seed_from_u64(seed);
        let directive = phrasings[rng.gen_range(0..phrasings.len())];

        let guarded = self
            .renderer
            .variable_contract(template)?
            .contains("tools");
        let block = directive_block(operator, directive, guarded);

        // Before the message loop first; at the very top if that position does
        // not end up in the rendered prompt.
        let first_line = directive.lines().next().unwrap_or(directive);
        let mut positions = Vec::with_capacity(2);
        if let Some(found) = RE_MESSAGE_LOOP.find(template) {
            positions.push(found.start());
        }
        positions.push(0);

        let mut last_error = InvalidMutation::DirectiveNotRendered;
        for position in positions {
            let mut mutated = String::with_capacity(template.len() + block.len());
            mutated.push_str(&template[..position]);
            mutated.push_str(&block);
            mutated.push_str(&template[position..]);

            match self.renderer.render_conversation(&mutated, &self.smoke) {
                Ok(prompt) if prompt.contains(first_line) => return Ok(mutated),
                Ok(_) => {
                    debug!(operator = %operator, position, "directive not rendered at insertion point");
                    last_error = InvalidMutation::DirectiveNotRendered;
                }
                Err(error) => last_error = InvalidMutation::RenderFailed(error),
            }
        }
        Err(last_error)
    }
}

fn directive_block(operator: &MutationOperator, directive: &str, guarded: bool) -> String {
    let body = format!("{{% raw %}}{directive}\n\n{{% endraw %}}");
    if guarded {
        format!("{{# mutation: {operator} #}}{{% if tools %}}{body}{{% endif %}}")
    } else {
        format!("{{# mutation: {operator} #}}{body}")
    }
}
