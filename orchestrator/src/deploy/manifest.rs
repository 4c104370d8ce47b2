//! Project detection, build manifests and runtime env files

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::errors::OrchestratorError;

/// Manifest written when the repository has none
pub const GENERATED_DOCKERFILE: &str = "Dockerfile.dockhand";

/// Suffix of the env file kept next to (never inside) the build context
pub const ENV_FILE_SUFFIX: &str = ".env";

/// Project kinds recognised by marker files, in detection order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    NextJs,
    Node,
    Python,
    Go,
    StaticSite,
}

impl ProjectKind {
    /// Detect from the top-level file names of the working tree
    pub fn detect<S: AsRef<str>>(files: &[S]) -> Option<ProjectKind> {
        let has = |name: &str| files.iter().any(|f| f.as_ref() == name);
        let has_prefix = |prefix: &str| files.iter().any(|f| f.as_ref().starts_with(prefix));

        if has_prefix("next.config.") {
            Some(ProjectKind::NextJs)
        } else if has("package.json") {
            Some(ProjectKind::Node)
        } else if has("requirements.txt") || has("pyproject.toml") {
            Some(ProjectKind::Python)
        } else if has("go.mod") {
            Some(ProjectKind::Go)
        } else if has("index.html") {
            Some(ProjectKind::StaticSite)
        } else {
            None
        }
    }

    pub fn dockerfile(&self, port: u16) -> String {
        match self {
            ProjectKind::NextJs => format!(
                r#"FROM node:20-alpine
WORKDIR /app
COPY package*.json ./
RUN npm install
COPY . .
RUN npm run build
ENV NODE_ENV=production
ENV PORT={port}
EXPOSE {port}
CMD ["npm", "start"]
"#
            ),
            ProjectKind::Node => format!(
                r#"FROM node:20-alpine
WORKDIR /app
COPY package*.json ./
RUN npm install --omit=dev
COPY . .
ENV NODE_ENV=production
ENV PORT={port}
EXPOSE {port}
CMD ["npm", "start"]
"#
            ),
            ProjectKind::Python => format!(
                r#"FROM python:3.12-slim
WORKDIR /app
COPY . .
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; else pip install --no-cache-dir .; fi
ENV PORT={port}
EXPOSE {port}
CMD ["sh", "-c", "if [ -f main.py ]; then exec python main.py; else exec python app.py; fi"]
"#
            ),
            ProjectKind::Go => format!(
                r#"FROM golang:1.22-alpine AS build
WORKDIR /src
COPY . .
RUN CGO_ENABLED=0 go build -o /out/app .

FROM alpine:3.20
COPY --from=build /out/app /usr/local/bin/app
ENV PORT={port}
EXPOSE {port}
CMD ["app"]
"#
            ),
            ProjectKind::StaticSite => format!(
                r#"FROM nginx:alpine
COPY . /usr/share/nginx/html
RUN sed -i 's/listen  *80;/listen {port};/' /etc/nginx/conf.d/default.conf
EXPOSE {port}
"#
            ),
        }
    }
}

pub fn validate_env_name(name: &str) -> Result<(), OrchestratorError> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let valid = RE
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
        .map(|re| re.is_match(name))
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::ValidationError(format!(
            "Invalid environment variable name: '{}'",
            name
        )))
    }
}

/// Docker env-file contents: declared vars plus `PORT`, which always wins
pub fn env_file_contents(
    env_vars: &BTreeMap<String, String>,
    port: u16,
) -> Result<String, OrchestratorError> {
    let mut lines = Vec::with_capacity(env_vars.len() + 1);
    for (name, value) in env_vars {
        validate_env_name(name)?;
        if value.contains('\n') || value.contains('\r') {
            return Err(OrchestratorError::ValidationError(format!(
                "Environment variable {} contains a line break",
                name
            )));
        }
        if name != "PORT" {
            lines.push(format!("{}={}", name, value));
        }
    }
    lines.push(format!("PORT={}", port));
    Ok(lines.join("\n") + "\n")
}
