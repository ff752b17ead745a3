use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tera::{Context, Tera};

use crate::core::call_tree::{CallTreeNode, MethodSummaryEntry};
use crate::core::model::{MethodDefinition, MethodMeta};
use crate::error::Result;
use super::ModelRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

const METHOD_ANALYSIS_SYSTEM: &str = "\
You analyze individual methods of a Java (Spring based) system. \
Given a method's source text, comment and declaration context, explain what it does. \
Use only the information provided. Do not include quotation marks in your answer.";

const METHOD_ANALYSIS_USER: &str = r#"Method information for a Java (Spring based) system is given below.

If both method_text and comment are empty, no analysis is possible. In that case return
{ "method_fqn": "{{ method_fqn }}", "summary": "", "description": "" }

Otherwise:
- summary: what the method does, in 2-3 sentences
- description: a step-by-step account of its internal flow

method_fqn:
[{{ method_fqn }}]

method_text:
[{{ method_text }}]

comment:
[{{ comment }}]

signature: [{{ method_signature }}]
return type: [{{ return_type }}]
modifiers: [{{ modifiers }}]
parameters: [{{ parameters }}]
file: [{{ file_path }}]
package: [{{ package_name }}]
class: [{{ class_name }}]
"#;

const FLOW_SUMMARY_SYSTEM: &str = "\
You interpret method call flows in Java (Spring based) systems. \
Read the entry point, its call tree and any method summaries, then produce a one-sentence insight \
on the purpose of the flow, a 2-3 sentence procedural reasoning, and a short summary_title. \
Use only the provided data. Do not include quotation marks in your answer.";

const FLOW_SUMMARY_USER: &str = r#"A method call flow from a Java (Spring based) system is given below.

If the call tree is empty, set success to false, leave summary_title, insight and reasoning empty.
Otherwise set success to true and follow the tree from the entry point.
The method summary map may be empty; then rely on the call tree alone.

entry_point:
[{{ entry_point }}]

call_tree:
[{{ call_tree }}]

method_summary_map (optional):
[{{ method_summary_map }}]
"#;

const DIAGRAM_SYSTEM: &str = "\
You write Mermaid sequence diagrams from Java method call trees. \
Declare each distinct class_name once as a participant. \
Walk the call tree recursively and draw caller ->> callee arrows labelled with display_name or method_fqn, never the summary. \
After a call add `Note right of <callee>` with the method summary when the summary is not blank. \
Close every call except the entry point with a -->> return arrow labelled with the return type, \
always ending the label with `: ` so empty labels still render. \
Message-style sends (kafkaTemplate.send, rabbitTemplate.convertAndSend) get a note instead of a return arrow. \
Arrow endpoints are class names only. Use only the provided data.";

const DIAGRAM_USER: &str = r#"Read the insight and reasoning first to understand the flow, then generate the diagram.

entry_point:
[{{ entry_point }}]

depth (for reference):
[{{ depth }}]

call_tree:
[{{ call_tree }}]

method_definitions:
[{{ method_definitions }}]

call_tree_summary_insight:
[{{ insight }}]

call_tree_summary_reasoning:
[{{ reasoning }}]
"#;

/// Renders the prompts for the three model stages
pub struct PromptLibrary {
    tera: Tera,
}

impl PromptLibrary {
    pub fn new() -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            ("method_analysis.txt", METHOD_ANALYSIS_USER),
            ("flow_summary.txt", FLOW_SUMMARY_USER),
            ("sequence_diagram.txt", DIAGRAM_USER),
        ])?;
        Ok(Self { tera })
    }

    fn render<T: Serialize>(&self, template: &str, data: &T) -> Result<String> {
        let context = Context::from_serialize(data)?;
        Ok(self.tera.render(template, &context)?)
    }

    pub fn method_analysis(&self, meta: &MethodMeta) -> Result<ModelRequest> {
        let user = self.render(
            "method_analysis.txt",
            &json!({
                "method_fqn": meta.method_fqn,
                "method_text": meta.method_text.as_deref().unwrap_or(""),
                "comment": meta.comment.as_deref().unwrap_or(""),
                "method_signature": meta.method_signature,
                "return_type": meta.return_type,
                "modifiers": meta.modifiers.join(" "),
                "parameters": serde_json::to_string(&meta.parameters)?,
                "file_path": meta.file_path,
                "package_name": meta.package_name,
                "class_name": meta.class_name,
            }),
        )?;

        Ok(ModelRequest {
            prompt: Prompt {
                system: METHOD_ANALYSIS_SYSTEM.to_string(),
                user,
            },
            schema_name: "method_analysis",
            schema: object_schema(&[
                ("method_fqn", "string"),
                ("summary", "string"),
                ("description", "string"),
            ]),
        })
    }

    pub fn flow_summary(
        &self,
        entry_point: &str,
        call_tree: &CallTreeNode,
        method_summary_map: &BTreeMap<String, MethodSummaryEntry>,
    ) -> Result<ModelRequest> {
        let user = self.render(
            "flow_summary.txt",
            &json!({
                "entry_point": entry_point,
                "call_tree": serde_json::to_string_pretty(call_tree)?,
                "method_summary_map": serde_json::to_string_pretty(method_summary_map)?,
            }),
        )?;

        Ok(ModelRequest {
            prompt: Prompt {
                system: FLOW_SUMMARY_SYSTEM.to_string(),
                user,
            },
            schema_name: "flow_summary",
            schema: object_schema(&[
                ("success", "boolean"),
                ("entry_point", "string"),
                ("summary_title", "string"),
                ("insight", "string"),
                ("reasoning", "string"),
            ]),
        })
    }

    pub fn sequence_diagram(
        &self,
        entry_point: &str,
        depth: usize,
        call_tree: &CallTreeNode,
        method_definitions: &[MethodDefinition],
        insight: &str,
        reasoning: &str,
    ) -> Result<ModelRequest> {
        let definitions: BTreeMap<&str, &MethodDefinition> = method_definitions
            .iter()
            .map(|d| (d.method_fqn.as_str(), d))
            .collect();

        let user = self.render(
            "sequence_diagram.txt",
            &json!({
                "entry_point": entry_point,
                "depth": depth,
                "call_tree": serde_json::to_string_pretty(call_tree)?,
                "method_definitions": serde_json::to_string_pretty(&definitions)?,
                "insight": insight,
                "reasoning": reasoning,
            }),
        )?;

        Ok(ModelRequest {
            prompt: Prompt {
                system: DIAGRAM_SYSTEM.to_string(),
                user,
            },
            schema_name: "sequence_diagram",
            schema: object_schema(&[("entry_point", "string"), ("mermaid_code", "string")]),
        })
    }
}

/// Strict object schema with every field required
fn object_schema(fields: &[(&str, &str)]) -> Value {
    let properties: serde_json::Map<String, Value> = fields
        .iter()
        .map(|(name, ty)| (name.to_string(), json!({ "type": ty })))
        .collect();
    let required: Vec<&str> = fields.iter().map(|(name, _)| *name).collect();

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}
