use trellis::FrameworkError;

/// The character that introduces a named path parameter segment.
pub const PARAM_START: char = ':';

/// The character that introduces a wildcard-tail path parameter
/// segment.
pub const WILDCARD_PARAM_START: char = '*';

/// One segment of a parsed path template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// matches its literal text exactly
    Static(String),
    /// matches any single segment, binding it to the parameter name
    Named(String),
    /// matches the remainder of the path, slashes included, binding
    /// it to the parameter name
    Wildcard(String),
}

/**
A parsed path template: the cleaned source path, its segments, and the
parameter names in order of appearance.
*/
#[derive(Clone, Debug, Default)]
pub struct Template {
    /// the cleaned source path, e.g. `/users/:id`
    pub src: String,
    /// the parsed segments
    pub segments: Vec<Segment>,
    /// parameter names in order of appearance, without `:` or `*`
    pub params: Vec<String>,
}

impl Template {
    /// Whether this template ends in a wildcard-tail segment.
    pub fn has_wildcard(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Wildcard(_)))
    }
}

/**
Normalize a raw path: a single leading slash, no duplicate slashes, no
trailing slash except for the root itself.
*/
pub fn clean_path(path: &str) -> String {
    let mut cleaned = String::with_capacity(path.len() + 1);
    cleaned.push('/');

    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if !cleaned.ends_with('/') {
            cleaned.push('/');
        }
        cleaned.push_str(segment);
    }

    cleaned
}

/**
Parse a raw path into a [`Template`].

Fails when a parameter has an empty name, a parameter name repeats
within the path, or a wildcard is followed by further segments.
*/
pub fn parse_template(raw_path: &str) -> Result<Template, FrameworkError> {
    let src = clean_path(raw_path);
    let mut segments = Vec::new();
    let mut params: Vec<String> = Vec::new();

    if src != "/" {
        for part in src.split('/').skip(1) {
            if matches!(segments.last(), Some(Segment::Wildcard(_))) {
                return Err(FrameworkError::new(format!(
                    "path {src}: a wildcard parameter must be the last segment"
                )));
            }

            let segment = if let Some(name) = part.strip_prefix(PARAM_START) {
                Segment::Named(validate_param(&src, name, &params)?)
            } else if let Some(name) = part.strip_prefix(WILDCARD_PARAM_START) {
                Segment::Wildcard(validate_param(&src, name, &params)?)
            } else {
                Segment::Static(String::from(part))
            };

            if let Segment::Named(name) | Segment::Wildcard(name) = &segment {
                params.push(name.clone());
            }
            segments.push(segment);
        }
    }

    Ok(Template {
        src,
        segments,
        params,
    })
}

fn validate_param(
    src: &str,
    name: &str,
    params: &[String],
) -> Result<String, FrameworkError> {
    if name.is_empty() {
        return Err(FrameworkError::new(format!(
            "path {src}: parameter with an empty name"
        )));
    }
    if params.iter().any(|existing| existing == name) {
        return Err(FrameworkError::new(format!(
            "path {src}: parameter name {name} is not unique"
        )));
    }
    Ok(String::from(name))
}

/**
Replace every dynamic segment of `path` with the `%v` placeholder:
`/api/users/:id` becomes `/api/users/%v`, `/files/*file` becomes
`/files/%v`. A fully static path is returned as-is.
*/
pub fn format_path(path: &str) -> String {
    if !path.contains(PARAM_START) && !path.contains(WILDCARD_PARAM_START) {
        return String::from(path);
    }

    let formatted = path
        .split('/')
        .filter(|part| !part.is_empty())
        .map(|part| {
            if part.starts_with(PARAM_START) || part.starts_with(WILDCARD_PARAM_START) {
                "%v"
            } else {
                part
            }
        })
        .collect::<Vec<_>>()
        .join("/");

    format!("/{formatted}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleaning() {
        assert_eq!(clean_path("/a//b/"), "/a/b");
        assert_eq!(clean_path("a/b"), "/a/b");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path(""), "/");
    }

    #[test]
    fn templates() {
        let tmpl = parse_template("/users/:id/files/*path").unwrap();
        assert_eq!(tmpl.src, "/users/:id/files/*path");
        assert_eq!(tmpl.params, vec!["id", "path"]);
        assert!(tmpl.has_wildcard());
        assert_eq!(tmpl.segments.len(), 4);

        assert!(parse_template("/users/:").is_err());
        assert!(parse_template("/users/:id/:id").is_err());
        assert!(parse_template("/files/*path/more").is_err());

        let root = parse_template("/").unwrap();
        assert!(root.segments.is_empty());
    }

    #[test]
    fn formatting() {
        assert_eq!(format_path("/api/users/:id"), "/api/users/%v");
        assert_eq!(format_path("/files/*file"), "/files/%v");
        assert_eq!(format_path("/:a/messages/:b"), "/%v/messages/%v");
        assert_eq!(format_path("/static"), "/static");
    }
}
