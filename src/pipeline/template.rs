//! Step templates with `{placeholder}` substitution

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::batch::WorkUnit;
use crate::pipeline::PipelineStep;

/// Errors raised while rendering a template
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// A placeholder has no value in the context
    #[error("Unknown placeholder '{{{name}}}' in '{template}'")]
    UnknownPlaceholder {
        /// Placeholder name
        name: String,
        /// Template being rendered
        template: String,
    },

    /// A `{` without its closing `}`
    #[error("Unclosed placeholder in '{0}'")]
    Unclosed(String),

    /// A lone `}`
    #[error("Unmatched '}}' in '{0}'")]
    UnmatchedClose(String),
}

/// Variables available to templates while a unit runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    vars: BTreeMap<String, String>,
}

impl TemplateContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Context seeded with the unit variables: `unit`, `subject`,
    /// `unit_dir` and, for session units, `session`
    pub fn for_unit(unit: &WorkUnit) -> Self {
        let mut ctx = Self::new();
        ctx.set("unit", &unit.id);
        ctx.set("subject", unit.subject());
        ctx.set("unit_dir", unit.root.to_string_lossy());
        if let Some(session) = unit.session_name() {
            ctx.set("session", session);
        }
        ctx
    }

    /// Set a variable, replacing any previous value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Builder form of [`set`](Self::set)
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Look up a variable
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Substitute every `{name}` in `template`. `{{` and `}}` produce literal braces.
    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for n in chars.by_ref() {
                        if n == '}' {
                            closed = true;
                            break;
                        }
                        name.push(n);
                    }
                    if !closed {
                        return Err(TemplateError::Unclosed(template.to_string()));
                    }
                    let value = self.get(&name).ok_or_else(|| TemplateError::UnknownPlaceholder {
                        name: name.clone(),
                        template: template.to_string(),
                    })?;
                    out.push_str(value);
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '}' => return Err(TemplateError::UnmatchedClose(template.to_string())),
                _ => out.push(c),
            }
        }

        Ok(out)
    }
}

/// Escape `text` so it renders verbatim
pub fn literal(text: &str) -> String {
    text.replace('{', "{{").replace('}', "}}")
}

/// How a captured stdout value is turned into a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureTransform {
    /// Whitespace-trimmed stdout
    #[default]
    Trimmed,
    /// Stdout parsed as an integer plus an offset
    IntegerOffset(i64),
}

/// Store a step's stdout as a variable for the following steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    /// Variable name
    pub name: String,
    /// Transformation applied to stdout
    pub transform: CaptureTransform,
}

impl Capture {
    /// Capture trimmed stdout
    pub fn trimmed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transform: CaptureTransform::Trimmed,
        }
    }

    /// Capture stdout as an integer shifted by `offset`
    pub fn integer_offset(name: impl Into<String>, offset: i64) -> Self {
        Self {
            name: name.into(),
            transform: CaptureTransform::IntegerOffset(offset),
        }
    }

    /// Apply the transform to raw stdout
    pub fn apply(&self, stdout: &str) -> Result<String, String> {
        let trimmed = stdout.trim();
        match self.transform {
            CaptureTransform::Trimmed => Ok(trimmed.to_string()),
            CaptureTransform::IntegerOffset(offset) => trimmed
                .parse::<i64>()
                .map(|v| (v + offset).to_string())
                .map_err(|_| format!("expected an integer for '{}', got '{}'", self.name, trimmed)),
        }
    }
}

/// One external invocation with placeholders, rendered per unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTemplate {
    /// Executable name or path
    pub program: String,
    /// Argument templates, in order
    pub args: Vec<String>,
    /// Environment overrides (values are templates)
    pub env: BTreeMap<String, String>,
    /// Output that must exist after success
    pub expected_output: Option<String>,
    /// Stdout capture for later steps
    pub capture: Option<Capture>,
}

impl StepTemplate {
    /// Template running `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            expected_output: None,
            capture: None,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment override
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Require an output file after success
    pub fn expect_output(mut self, path: impl Into<String>) -> Self {
        self.expected_output = Some(path.into());
        self
    }

    /// Capture stdout into a variable
    pub fn capture(mut self, capture: Capture) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Render into a concrete step
    pub fn render(&self, ctx: &TemplateContext) -> Result<PipelineStep, TemplateError> {
        let arguments = self
            .args
            .iter()
            .map(|a| ctx.render(a))
            .collect::<Result<Vec<_>, _>>()?;

        let env = self
            .env
            .iter()
            .map(|(k, v)| Ok((k.clone(), ctx.render(v)?)))
            .collect::<Result<BTreeMap<_, _>, TemplateError>>()?;

        let expected_output = self
            .expected_output
            .as_deref()
            .map(|p| ctx.render(p).map(PathBuf::from))
            .transpose()?;

        Ok(PipelineStep {
            program: ctx.render(&self.program)?,
            arguments,
            env,
            expected_output,
            capture: self.capture.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_render_substitutes_variables() {
        let ctx = TemplateContext::new()
            .with("unit_dir", "/data/1000037")
            .with("hemi", "lh");
        assert_eq!(
            ctx.render("{unit_dir}/surf/{hemi}.sphere.reg").unwrap(),
            "/data/1000037/surf/lh.sphere.reg"
        );
    }

    #[test]
    fn test_render_escapes_braces() {
        let ctx = TemplateContext::new().with("x", "1");
        assert_eq!(ctx.render("{{x}} = {x}").unwrap(), "{x} = 1");
    }

    #[test]
    fn test_literal_round_trips() {
        let ctx = TemplateContext::new();
        assert_eq!(ctx.render(&literal("/data/{odd}/dir")).unwrap(), "/data/{odd}/dir");
    }

    #[test]
    fn test_render_errors() {
        let ctx = TemplateContext::new();
        assert!(matches!(
            ctx.render("{missing}"),
            Err(TemplateError::UnknownPlaceholder { .. })
        ));
        assert!(matches!(ctx.render("{open"), Err(TemplateError::Unclosed(_))));
        assert!(matches!(ctx.render("close}"), Err(TemplateError::UnmatchedClose(_))));
    }

    #[test]
    fn test_unit_context() {
        let unit = WorkUnit::session("sub_01", "ses-1", "/d/sub_01/ses-1");
        let ctx = TemplateContext::for_unit(&unit);
        assert_eq!(ctx.get("unit"), Some("sub_01/ses-1"));
        assert_eq!(ctx.get("subject"), Some("sub_01"));
        assert_eq!(ctx.get("session"), Some("ses-1"));
        assert_eq!(ctx.get("unit_dir"), Some("/d/sub_01/ses-1"));
    }

    #[test]
    fn test_step_render() {
        let template = StepTemplate::new("mri_segstats")
            .args(["--seg", "{mri}/seg.mgz", "--excludeid", "0"])
            .env("SUBJECTS_DIR", "{data_dir}")
            .expect_output("{mri}/seg.stats");
        let ctx = TemplateContext::new().with("mri", "/s/mri").with("data_dir", "/data");

        let step = template.render(&ctx).unwrap();
        assert_eq!(step.arguments, vec!["--seg", "/s/mri/seg.mgz", "--excludeid", "0"]);
        assert_eq!(step.env.get("SUBJECTS_DIR").map(String::as_str), Some("/data"));
        assert_eq!(step.expected_output, Some(PathBuf::from("/s/mri/seg.stats")));
    }

    #[test]
    fn test_capture_transforms() {
        assert_eq!(Capture::trimmed("v").apply("  abc\n").unwrap(), "abc");
        assert_eq!(Capture::integer_offset("dimx", -2).apply("96 \n").unwrap(), "94");
        assert!(Capture::integer_offset("dimx", -2).apply("n/a").is_err());
    }

    proptest! {
        #[test]
        fn prop_brace_free_text_renders_unchanged(s in "[^{}]*") {
            let ctx = TemplateContext::new();
            prop_assert_eq!(ctx.render(&s).unwrap(), s);
        }
    }
}
