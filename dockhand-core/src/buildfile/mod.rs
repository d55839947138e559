//! Build file parsing.
//!
//! Reads the subset of the multi-stage build syntax the orchestrator cares
//! about: `FROM` (with stage names), `WORKDIR`, `COPY`, `USER`, and `CMD`,
//! each scoped to its stage. Every other instruction is tolerated and
//! skipped; line continuations and comments are handled before parsing.

use std::fmt;
use std::path::Path;

pub mod vfs;

pub use vfs::VirtualFs;

/// A parsed build file: one entry per `FROM` stage, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildFile {
    pub stages: Vec<Stage>,
}

/// One build stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    /// Stage name from `FROM ... AS name`.
    pub name: Option<String>,
    /// Base image reference, or the name of an earlier stage.
    pub from: String,
    /// Last `WORKDIR` declared in this stage.
    pub workdir: Option<String>,
    /// Last `USER` declared in this stage.
    pub user: Option<String>,
    /// Last `CMD` declared in this stage.
    pub cmd: Option<CmdSpec>,
    /// `COPY` instructions in declaration order.
    pub copies: Vec<CopyInstruction>,
}

/// CMD in shell or exec form.
#[derive(Debug, Clone, PartialEq)]
pub enum CmdSpec {
    /// `CMD npm start`
    Shell(String),
    /// `CMD ["npm", "start"]`
    Exec(Vec<String>),
}

impl CmdSpec {
    /// Flat text of the command, used for runtime detection.
    pub fn text(&self) -> String {
        match self {
            CmdSpec::Shell(s) => s.clone(),
            CmdSpec::Exec(args) => args.join(" "),
        }
    }
}

/// A `COPY [--from=stage] src... dest` instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyInstruction {
    pub from_stage: Option<String>,
    pub sources: Vec<String>,
    pub dest: String,
}

/// Build file parse error with a 1-based line number.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

impl BuildFile {
    /// Parse build file content.
    pub fn parse(content: &str) -> Result<Self, ParseError> {
        let lines = preprocess(content);
        let mut stages: Vec<Stage> = Vec::new();

        for (line_num, line) in lines {
            let instruction = line.split_whitespace().next().unwrap_or("").to_uppercase();
            let args = extract_args(&line);

            if instruction == "FROM" {
                stages.push(parse_from(line_num, &args)?);
                continue;
            }

            let Some(stage) = stages.last_mut() else {
                // ARG before the first FROM is legal; anything else is not.
                if instruction == "ARG" || instruction.is_empty() {
                    continue;
                }
                return Err(ParseError {
                    line: line_num,
                    message: format!("expected FROM, found {}", instruction),
                });
            };

            match instruction.as_str() {
                "WORKDIR" => {
                    if args.is_empty() {
                        return Err(ParseError {
                            line: line_num,
                            message: "WORKDIR requires a path".into(),
                        });
                    }
                    stage.workdir = Some(args.join(" "));
                }
                "USER" => {
                    if args.is_empty() {
                        return Err(ParseError {
                            line: line_num,
                            message: "USER requires a user name".into(),
                        });
                    }
                    stage.user = Some(args.join(" "));
                }
                "CMD" => stage.cmd = Some(parse_cmd(&args)),
                "COPY" => stage.copies.push(parse_copy(line_num, &args)?),
                // ADD behaves like COPY for path-mapping purposes.
                "ADD" => stage.copies.push(parse_copy(line_num, &args)?),
                _ => {} // RUN, ENV, EXPOSE, ... carry no path information we need
            }
        }

        if stages.is_empty() {
            return Err(ParseError {
                line: 1,
                message: "build file must contain at least one FROM instruction".into(),
            });
        }

        Ok(BuildFile { stages })
    }

    /// Parse a build file from disk.
    pub fn parse_file(path: &Path) -> Result<Self, ParseError> {
        let content = std::fs::read_to_string(path).map_err(|e| ParseError {
            line: 0,
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::parse(&content)
    }

    /// The stage a build resolves to: the named target, else the last stage.
    pub fn final_stage(&self, target: Option<&str>) -> Option<&Stage> {
        match target {
            Some(name) => self.stages.iter().find(|s| s.name.as_deref() == Some(name)),
            None => self.stages.last(),
        }
    }

    /// Stages reachable from the final stage through `FROM` references and
    /// `COPY --from`, ordered base-first. The final stage is always last.
    pub fn used_stages(&self, target: Option<&str>) -> Vec<&Stage> {
        let Some(final_stage) = self.final_stage(target) else {
            return Vec::new();
        };

        let mut used: Vec<&Stage> = Vec::new();
        let mut pending = vec![final_stage];

        while let Some(stage) = pending.pop() {
            if used.iter().any(|s| std::ptr::eq(*s, stage)) {
                continue;
            }
            used.push(stage);

            let mut refs: Vec<&str> = vec![stage.from.as_str()];
            refs.extend(stage.copies.iter().filter_map(|c| c.from_stage.as_deref()));
            for name in refs {
                if let Some(parent) = self.stages.iter().find(|s| s.name.as_deref() == Some(name))
                {
                    pending.push(parent);
                }
            }
        }

        used.reverse();
        used
    }

    /// Base image of the final stage, following stage references back to a
    /// real image.
    pub fn resolved_base_image(&self, target: Option<&str>) -> Option<String> {
        let mut stage = self.final_stage(target)?;
        loop {
            match self.stages.iter().find(|s| s.name.as_deref() == Some(stage.from.as_str())) {
                Some(parent) => stage = parent,
                None => return Some(stage.from.clone()),
            }
        }
    }
}

/// Combine continuation lines and strip comments, keeping 1-based numbers.
fn preprocess(content: &str) -> Vec<(usize, String)> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut current_num = 0;
    let mut continuation = false;

    for (idx, raw) in content.lines().enumerate() {
        let line_num = idx + 1;
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let trimmed = line.trim_end();

        if trimmed.is_empty() && !continuation {
            continue;
        }

        if continuation {
            current.push(' ');
            current.push_str(trimmed.trim_end_matches('\\').trim());
        } else {
            current_num = line_num;
            current = trimmed.trim_end_matches('\\').trim().to_string();
        }

        continuation = trimmed.ends_with('\\');
        if !continuation && !current.is_empty() {
            result.push((current_num, std::mem::take(&mut current)));
        }
    }

    if !current.is_empty() {
        result.push((current_num, current));
    }

    result
}

fn extract_args(line: &str) -> Vec<String> {
    let mut parts = line.splitn(2, char::is_whitespace);
    parts.next();
    match parts.next() {
        Some(rest) => rest.split_whitespace().map(str::to_string).collect(),
        None => Vec::new(),
    }
}

fn parse_from(line_num: usize, args: &[String]) -> Result<Stage, ParseError> {
    let mut idx = 0;
    // FROM [--platform=...] image [AS name]
    if args.get(0).map(|a| a.starts_with("--platform=")).unwrap_or(false) {
        idx = 1;
    }

    let Some(image) = args.get(idx) else {
        return Err(ParseError { line: line_num, message: "FROM requires an image".into() });
    };

    let name = if args.get(idx + 1).map(|a| a.eq_ignore_ascii_case("AS")).unwrap_or(false) {
        match args.get(idx + 2) {
            Some(name) => Some(name.clone()),
            None => {
                return Err(ParseError {
                    line: line_num,
                    message: "FROM ... AS requires a stage name".into(),
                })
            }
        }
    } else {
        None
    };

    Ok(Stage { name, from: image.clone(), workdir: None, user: None, cmd: None, copies: Vec::new() })
}

fn parse_cmd(args: &[String]) -> CmdSpec {
    let joined = args.join(" ");
    if joined.starts_with('[') {
        if let Ok(exec) = serde_json::from_str::<Vec<String>>(&joined) {
            return CmdSpec::Exec(exec);
        }
    }
    CmdSpec::Shell(joined)
}

fn parse_copy(line_num: usize, args: &[String]) -> Result<CopyInstruction, ParseError> {
    let mut from_stage = None;
    let mut start = 0;

    for (i, arg) in args.iter().enumerate() {
        if let Some(stage) = arg.strip_prefix("--from=") {
            from_stage = Some(stage.to_string());
            start = i + 1;
        } else if arg.starts_with("--") {
            // --chown, --chmod, --link: irrelevant to path mapping
            start = i + 1;
        } else {
            break;
        }
    }

    let rest = &args[start..];
    if rest.len() < 2 {
        return Err(ParseError {
            line: line_num,
            message: "COPY requires at least source and destination".into(),
        });
    }

    Ok(CopyInstruction {
        from_stage,
        sources: rest[..rest.len() - 1].to_vec(),
        dest: rest.last().unwrap().clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_stage() {
        let file = BuildFile::parse(
            r#"
FROM node:20-alpine
WORKDIR /app
COPY package.json package-lock.json ./
COPY . .
USER node
CMD ["node", "server.js"]
"#,
        )
        .unwrap();

        assert_eq!(file.stages.len(), 1);
        let stage = &file.stages[0];
        assert_eq!(stage.from, "node:20-alpine");
        assert_eq!(stage.workdir.as_deref(), Some("/app"));
        assert_eq!(stage.user.as_deref(), Some("node"));
        assert_eq!(stage.copies.len(), 2);
        assert_eq!(stage.copies[0].sources, vec!["package.json", "package-lock.json"]);
        assert_eq!(
            stage.cmd,
            Some(CmdSpec::Exec(vec!["node".to_string(), "server.js".to_string()]))
        );
    }

    #[test]
    fn test_multi_stage_names_and_final() {
        let file = BuildFile::parse(
            r#"
FROM node:20 AS deps
WORKDIR /app
COPY package.json ./

FROM node:20 AS runtime
WORKDIR /srv/app
COPY --from=deps /app/node_modules ./node_modules
CMD npm start
"#,
        )
        .unwrap();

        assert_eq!(file.stages.len(), 2);
        assert_eq!(file.final_stage(None).unwrap().name.as_deref(), Some("runtime"));
        assert_eq!(file.final_stage(Some("deps")).unwrap().workdir.as_deref(), Some("/app"));
        assert_eq!(file.stages[1].copies[0].from_stage.as_deref(), Some("deps"));
    }

    #[test]
    fn test_used_stages_follow_copy_from() {
        let file = BuildFile::parse(
            r#"
FROM node:20 AS base
WORKDIR /app

FROM base AS deps
COPY package.json ./

FROM alpine AS unrelated
WORKDIR /x

FROM base AS final
WORKDIR /app
COPY --from=deps /app/node_modules ./node_modules
"#,
        )
        .unwrap();

        let used: Vec<_> =
            file.used_stages(None).iter().map(|s| s.name.clone().unwrap()).collect();
        assert!(used.contains(&"base".to_string()));
        assert!(used.contains(&"deps".to_string()));
        assert!(used.contains(&"final".to_string()));
        assert!(!used.contains(&"unrelated".to_string()));
        assert_eq!(used.last().unwrap(), "final");
    }

    #[test]
    fn test_resolved_base_image_follows_stage_chain() {
        let file = BuildFile::parse(
            r#"
FROM node:20-bullseye AS base
WORKDIR /app

FROM base
WORKDIR /app
"#,
        )
        .unwrap();

        assert_eq!(file.resolved_base_image(None).as_deref(), Some("node:20-bullseye"));
    }

    #[test]
    fn test_line_continuations_and_comments() {
        let file = BuildFile::parse(
            r#"
# comment
FROM node:20   # trailing comment
RUN apt-get update && \
    apt-get install -y build-essential
WORKDIR /app
"#,
        )
        .unwrap();

        assert_eq!(file.stages[0].workdir.as_deref(), Some("/app"));
    }

    #[test]
    fn test_unknown_instruction_is_skipped() {
        let file = BuildFile::parse("FROM node:20\nHEALTHCHECK CMD curl localhost\nWORKDIR /app\n")
            .unwrap();
        assert_eq!(file.stages[0].workdir.as_deref(), Some("/app"));
    }

    #[test]
    fn test_missing_from_is_error() {
        assert!(BuildFile::parse("WORKDIR /app\n").is_err());
        assert!(BuildFile::parse("").is_err());
    }

    #[test]
    fn test_copy_needs_source_and_dest() {
        assert!(BuildFile::parse("FROM node:20\nCOPY onlyone\n").is_err());
    }
}
