//! Path templates for the provenance store.
//!
//! A template is literal text with `{...}` expressions:
//!
//! | form | renders |
//! |---|---|
//! | `{var}` | the context value |
//! | `{var[:n]}` | its first `n` characters |
//! | `{hash(var)}` / `{hash(var)[:n]}` | SHA-256 hex of the value, optionally truncated |
//! | `{shard(var,d,w)}` | `d` segments of `w` hex chars taken from the value's hash, joined by `/` |
//!
//! Templates are parsed once when a schema is built; anything else inside
//! braces is rejected there, and a missing context variable fails the render.

use modelops_core::{sha256_str, SchemaChoice};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const HASH_HEX_LEN: usize = 64;

pub const BUNDLE_SCHEMA_NAME: &str = "bundle";
pub const TOKEN_SCHEMA_NAME: &str = "token";
pub const BUILTIN_SCHEMA_VERSION: &str = "2";

const ROOT_TEMPLATE: &str = "{schema_name}/v{version}";
const JOB_TEMPLATE: &str = "jobs/{job_id}";
const BUNDLE_SIM_TEMPLATE: &str =
    "sims/{bundle_digest[:12]}/{shard(param_id,2,2)}/params_{param_id[:8]}/seed_{seed}";
const BUNDLE_AGG_TEMPLATE: &str =
    "aggs/{bundle_digest[:12]}/target_{target}/agg_{aggregation_id}";
const TOKEN_SIM_TEMPLATE: &str =
    "sims/{model_digest[:12]}/{shard(param_id,2,2)}/params_{param_id[:8]}/seed_{seed}";
const TOKEN_AGG_TEMPLATE: &str = "aggs/{model_digest[:12]}/target_{target}/agg_{aggregation_id}";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("unbalanced '{brace}' at byte {position} in template '{template}'")]
    UnbalancedBraces {
        template: String,
        position: usize,
        brace: char,
    },
    #[error("unrecognized expression '{{{expression}}}' in template '{template}'")]
    UnrecognizedExpression { template: String, expression: String },
    #[error("invalid expression '{{{expression}}}' in template '{template}': {reason}")]
    InvalidExpression {
        template: String,
        expression: String,
        reason: String,
    },
    #[error("template '{template}' references '{variable}', which is missing from the context")]
    MissingVariable { template: String, variable: String },
    #[error("template '{template}' rendered an unusable path '{path}': {reason}")]
    InvalidRenderedPath {
        template: String,
        path: String,
        reason: &'static str,
    },
    #[error("invalid schema {field} '{value}': {reason}")]
    InvalidSchema {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Named string values a template is rendered against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathContext {
    values: BTreeMap<String, String>,
}

impl PathContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Var(String),
    Prefix { var: String, len: usize },
    Hash { var: String, len: Option<usize> },
    Shard { var: String, depth: usize, width: usize },
}

impl Expr {
    fn var(&self) -> &str {
        match self {
            Expr::Var(var)
            | Expr::Prefix { var, .. }
            | Expr::Hash { var, .. }
            | Expr::Shard { var, .. } => var,
        }
    }

    fn render(&self, value: &str) -> String {
        match self {
            Expr::Var(_) => value.to_string(),
            Expr::Prefix { len, .. } => value.chars().take(*len).collect(),
            Expr::Hash { len, .. } => {
                let digest = sha256_str(value);
                match len {
                    Some(n) => digest[..*n].to_string(),
                    None => digest,
                }
            }
            Expr::Shard { depth, width, .. } => shard_segments(value, *depth, *width),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Expr(Expr),
}

/// A parsed, validated path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(source: &str) -> Result<Self, SchemaError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source.char_indices();
        while let Some((pos, ch)) = rest.next() {
            match ch {
                '{' => {
                    let mut inner = String::new();
                    let mut closed = false;
                    for (inner_pos, inner_ch) in rest.by_ref() {
                        match inner_ch {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => {
                                return Err(SchemaError::UnbalancedBraces {
                                    template: source.to_string(),
                                    position: inner_pos,
                                    brace: '{',
                                })
                            }
                            c => inner.push(c),
                        }
                    }
                    if !closed {
                        return Err(SchemaError::UnbalancedBraces {
                            template: source.to_string(),
                            position: pos,
                            brace: '{',
                        });
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Expr(parse_expr(source, &inner)?));
                }
                '}' => {
                    return Err(SchemaError::UnbalancedBraces {
                        template: source.to_string(),
                        position: pos,
                        brace: '}',
                    })
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Variables referenced by the template, in order of first use.
    pub fn variables(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Expr(expr) = segment {
                if !vars.contains(&expr.var()) {
                    vars.push(expr.var());
                }
            }
        }
        vars
    }

    pub fn render(&self, ctx: &PathContext) -> Result<String, SchemaError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr(expr) => {
                    let value =
                        ctx.get(expr.var())
                            .ok_or_else(|| SchemaError::MissingVariable {
                                template: self.source.clone(),
                                variable: expr.var().to_string(),
                            })?;
                    out.push_str(&expr.render(value));
                }
            }
        }
        check_rendered_path(&self.source, &out)?;
        Ok(out)
    }
}

impl FromStr for PathTemplate {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn check_rendered_path(template: &str, path: &str) -> Result<(), SchemaError> {
    let invalid = |reason| {
        Err(SchemaError::InvalidRenderedPath {
            template: template.to_string(),
            path: path.to_string(),
            reason,
        })
    };
    if path.is_empty() {
        return invalid("path is empty");
    }
    if path.starts_with('/') {
        return invalid("path must be relative");
    }
    if path.contains('\\') {
        return invalid("path contains a backslash");
    }
    for segment in path.split('/') {
        match segment {
            "" => return invalid("path has an empty segment"),
            "." | ".." => return invalid("path has a relative segment"),
            _ => {}
        }
    }
    Ok(())
}

/// `depth` segments of `width` hex characters drawn from SHA-256 of `value`.
pub fn shard_segments(value: &str, depth: usize, width: usize) -> String {
    let digest = sha256_str(value);
    (0..depth)
        .map(|i| &digest[i * width..(i + 1) * width])
        .collect::<Vec<_>>()
        .join("/")
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parses an optional `[:n]` suffix. `Err(())` means the suffix is not a slice.
fn parse_slice(suffix: &str) -> Result<Option<usize>, ()> {
    if suffix.is_empty() {
        return Ok(None);
    }
    let digits = suffix
        .strip_prefix("[:")
        .and_then(|s| s.strip_suffix(']'))
        .ok_or(())?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(());
    }
    digits.parse::<usize>().map(Some).map_err(|_| ())
}

fn parse_expr(template: &str, expression: &str) -> Result<Expr, SchemaError> {
    let unrecognized = || SchemaError::UnrecognizedExpression {
        template: template.to_string(),
        expression: expression.to_string(),
    };
    let invalid = |reason: String| SchemaError::InvalidExpression {
        template: template.to_string(),
        expression: expression.to_string(),
        reason,
    };

    if let Some(rest) = expression.strip_prefix("hash(") {
        let close = rest.find(')').ok_or_else(unrecognized)?;
        let var = &rest[..close];
        if !is_identifier(var) {
            return Err(unrecognized());
        }
        let len = parse_slice(&rest[close + 1..]).map_err(|_| unrecognized())?;
        if let Some(n) = len {
            if n == 0 || n > HASH_HEX_LEN {
                return Err(invalid(format!(
                    "hash prefix length must be between 1 and {}, got {}",
                    HASH_HEX_LEN, n
                )));
            }
        }
        return Ok(Expr::Hash {
            var: var.to_string(),
            len,
        });
    }

    if let Some(rest) = expression.strip_prefix("shard(") {
        let args = rest.strip_suffix(')').ok_or_else(unrecognized)?;
        let parts: Vec<&str> = args.split(',').map(str::trim).collect();
        let [var, depth, width] = parts.as_slice() else {
            return Err(unrecognized());
        };
        if !is_identifier(var) {
            return Err(unrecognized());
        }
        let depth: usize = depth.parse().map_err(|_| unrecognized())?;
        let width: usize = width.parse().map_err(|_| unrecognized())?;
        if depth == 0 || width == 0 {
            return Err(invalid("shard depth and width must be at least 1".into()));
        }
        if depth * width > HASH_HEX_LEN {
            return Err(invalid(format!(
                "shard needs {} hex characters but the hash only has {}",
                depth * width,
                HASH_HEX_LEN
            )));
        }
        return Ok(Expr::Shard {
            var: var.to_string(),
            depth,
            width,
        });
    }

    if let Some(open) = expression.find('[') {
        let var = &expression[..open];
        if !is_identifier(var) {
            return Err(unrecognized());
        }
        return match parse_slice(&expression[open..]) {
            Ok(Some(0)) => Err(invalid("prefix length must be at least 1".into())),
            Ok(Some(len)) => Ok(Expr::Prefix {
                var: var.to_string(),
                len,
            }),
            _ => Err(unrecognized()),
        };
    }

    if is_identifier(expression) {
        return Ok(Expr::Var(expression.to_string()));
    }
    Err(unrecognized())
}

pub(crate) fn check_namespace_part(field: &'static str, value: &str) -> Result<(), SchemaError> {
    let invalid = |reason| {
        Err(SchemaError::InvalidSchema {
            field,
            value: value.to_string(),
            reason,
        })
    };
    if value.is_empty() {
        return invalid("must not be empty");
    }
    if value == "." || value == ".." || value.contains(['/', '\\', '{', '}']) {
        return invalid("must be a single plain path segment");
    }
    Ok(())
}

/// An isolated, versioned storage namespace plus the templates that place
/// simulation, aggregation and job records inside it.
///
/// Changing `name` or `version` changes the rendered root, so old entries are
/// never reinterpreted under a new layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceSchema {
    name: String,
    version: String,
    root_template: PathTemplate,
    sim_path_template: PathTemplate,
    agg_path_template: PathTemplate,
    job_path_template: PathTemplate,
}

impl ProvenanceSchema {
    pub fn new(
        name: &str,
        version: &str,
        root_template: &str,
        sim_path_template: &str,
        agg_path_template: &str,
        job_path_template: &str,
    ) -> Result<Self, SchemaError> {
        check_namespace_part("name", name)?;
        check_namespace_part("version", version)?;
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            root_template: PathTemplate::parse(root_template)?,
            sim_path_template: PathTemplate::parse(sim_path_template)?,
            agg_path_template: PathTemplate::parse(agg_path_template)?,
            job_path_template: PathTemplate::parse(job_path_template)?,
        })
    }

    /// Paths keyed by the bundle digest: any rebuild of the bundle is a miss.
    pub fn bundle_invalidation() -> Result<Self, SchemaError> {
        Self::new(
            BUNDLE_SCHEMA_NAME,
            BUILTIN_SCHEMA_VERSION,
            ROOT_TEMPLATE,
            BUNDLE_SIM_TEMPLATE,
            BUNDLE_AGG_TEMPLATE,
            JOB_TEMPLATE,
        )
    }

    /// Paths keyed by the model digest: repackaging the same model still hits.
    pub fn token_invalidation() -> Result<Self, SchemaError> {
        Self::new(
            TOKEN_SCHEMA_NAME,
            BUILTIN_SCHEMA_VERSION,
            ROOT_TEMPLATE,
            TOKEN_SIM_TEMPLATE,
            TOKEN_AGG_TEMPLATE,
            JOB_TEMPLATE,
        )
    }

    pub fn for_choice(choice: SchemaChoice) -> Result<Self, SchemaError> {
        match choice {
            SchemaChoice::Bundle => Self::bundle_invalidation(),
            SchemaChoice::Token => Self::token_invalidation(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn sim_path_template(&self) -> &PathTemplate {
        &self.sim_path_template
    }

    pub fn agg_path_template(&self) -> &PathTemplate {
        &self.agg_path_template
    }

    fn with_identity(&self, ctx: &PathContext) -> PathContext {
        ctx.clone()
            .with("schema_name", &self.name)
            .with("version", &self.version)
    }

    /// Parses `template` and renders it against `ctx` plus this schema's
    /// `schema_name` and `version`.
    pub fn render_path(&self, template: &str, ctx: &PathContext) -> Result<String, SchemaError> {
        PathTemplate::parse(template)?.render(&self.with_identity(ctx))
    }

    /// Namespace prefix shared by every path of this schema.
    pub fn root_prefix(&self) -> Result<String, SchemaError> {
        self.root_template
            .render(&self.with_identity(&PathContext::new()))
    }

    fn namespaced(&self, template: &PathTemplate, ctx: &PathContext) -> Result<String, SchemaError> {
        let ctx = self.with_identity(ctx);
        let root = self.root_template.render(&ctx)?;
        let rel = template.render(&ctx)?;
        Ok(format!("{}/{}", root, rel))
    }

    pub fn sim_path(&self, ctx: &PathContext) -> Result<String, SchemaError> {
        self.namespaced(&self.sim_path_template, ctx)
    }

    pub fn agg_path(&self, ctx: &PathContext) -> Result<String, SchemaError> {
        self.namespaced(&self.agg_path_template, ctx)
    }

    pub fn job_path(&self, ctx: &PathContext) -> Result<String, SchemaError> {
        self.namespaced(&self.job_path_template, ctx)
    }
}
