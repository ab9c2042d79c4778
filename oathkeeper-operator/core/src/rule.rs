//! Oathkeeper access rules and their synthesis from a [`ProtectedUpstream`].

use crate::upstream::ProtectedUpstream;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Methods matched by every generated rule.
pub const METHODS: [&str; 6] = ["GET", "POST", "OPTION", "PUT", "PATCH", "DELETE"];

/// Regex alternation that matches a URL regardless of whether TLS was terminated in front of
/// the proxy.
const ANY_HTTP_SCHEME: &str = "<https|http>";

/// A single Oathkeeper access rule document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub id: String,
    #[serde(rename = "match")]
    pub matches: RuleMatch,
    pub authenticators: Vec<Handler>,
    pub mutators: Vec<Handler>,
    pub authorizer: Handler,
    pub errors: Vec<Handler>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub url: String,
    pub methods: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    pub handler: HandlerName,
}

/// Names a strategy registered in the Oathkeeper configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerName {
    Noop,
    CookieSession,
    Anonymous,
    Header,
    Json,
    Redirect,
    Allow,
    Deny,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleKind {
    Allow,
    Deny,
}

/// The rules derived for one upstream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessRules {
    pub allow: Vec<AccessRule>,
    pub deny: Vec<AccessRule>,
}

/// A named rule document, ready to be written to an artifact store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub kind: RuleKind,
    pub name: String,
    pub content: String,
}

/// The artifacts written for a single relation: at most one per rule kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArtifactNames {
    pub allow: Option<String>,
    pub deny: Option<String>,
}

/// Derives the access rules for an upstream.
///
/// For each protected URL (in order) this emits one allow rule per allowed endpoint and exactly
/// one deny rule. The deny rule requires a session for every path under the URL except the
/// allowed endpoints and their sub-paths.
pub fn synthesize(upstream: &ProtectedUpstream) -> AccessRules {
    let ProtectedUpstream {
        app_name,
        protected_urls,
        allowed_endpoints,
        ..
    } = upstream;

    let mut rules = AccessRules::default();
    for (index, url) in protected_urls.iter().enumerate() {
        let url = normalize_url(url);

        for endpoint in allowed_endpoints {
            rules.allow.push(AccessRule::new(
                format!("{app_name}:{endpoint}:{index}:allow"),
                format!("{url}/{endpoint}"),
                HandlerName::Noop,
                HandlerName::Noop,
                HandlerName::Json,
            ));
        }

        rules.deny.push(AccessRule::new(
            format!("{app_name}:{index}:deny"),
            deny_pattern(&url, allowed_endpoints),
            HandlerName::CookieSession,
            HandlerName::Header,
            HandlerName::Redirect,
        ));
    }
    rules
}

/// Strips a single trailing slash and widens an `https` scheme to match plain `http` as well.
pub fn normalize_url(url: &str) -> String {
    let url = url.strip_suffix('/').unwrap_or(url);
    match url.split_once("://") {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("https") => {
            format!("{ANY_HTTP_SCHEME}://{rest}")
        }
        _ => url.to_string(),
    }
}

fn deny_pattern(url: &str, allowed_endpoints: &[String]) -> String {
    if allowed_endpoints.is_empty() {
        return format!("{url}/<.*>");
    }

    // An endpoint is excluded only at a path boundary, so `welcome` excludes `/welcome` and
    // `/welcome/page` but not `/welcomeback`.
    let excluded = allowed_endpoints
        .iter()
        .map(|endpoint| regex::escape(endpoint))
        .collect::<Vec<_>>()
        .join("|");
    format!("{url}/<(?!(?:{excluded})(?:/|$)).*>")
}

/// Names the artifact that holds an application's rules of the given kind.
pub fn artifact_name(app_name: &str, kind: RuleKind) -> String {
    format!("access-rules-{app_name}-{kind}.json")
}

// === impl AccessRule ===

impl AccessRule {
    fn new(
        id: String,
        url: String,
        authenticator: HandlerName,
        mutator: HandlerName,
        error_handler: HandlerName,
    ) -> Self {
        Self {
            id,
            matches: RuleMatch {
                url,
                methods: METHODS.iter().map(ToString::to_string).collect(),
            },
            authenticators: vec![Handler {
                handler: authenticator,
            }],
            mutators: vec![Handler { handler: mutator }],
            authorizer: Handler {
                handler: HandlerName::Allow,
            },
            errors: vec![Handler {
                handler: error_handler,
            }],
        }
    }
}

// === impl RuleKind ===

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl AccessRules ===

impl AccessRules {
    /// Serializes the rules into artifacts, skipping empty rule lists: a kind with nothing to
    /// match is represented by the absence of its artifact.
    pub fn into_artifacts(self, app_name: &str) -> Result<Vec<Artifact>, serde_json::Error> {
        let mut artifacts = Vec::with_capacity(2);
        for (kind, rules) in [(RuleKind::Allow, self.allow), (RuleKind::Deny, self.deny)] {
            if rules.is_empty() {
                continue;
            }
            artifacts.push(Artifact {
                kind,
                name: artifact_name(app_name, kind),
                content: serde_json::to_string_pretty(&rules)?,
            });
        }
        Ok(artifacts)
    }
}

// === impl ArtifactNames ===

impl ArtifactNames {
    pub fn insert(&mut self, kind: RuleKind, name: String) {
        match kind {
            RuleKind::Allow => self.allow = Some(name),
            RuleKind::Deny => self.deny = Some(name),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.allow.iter().chain(self.deny.iter()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.iter().any(|n| n == name)
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_none() && self.deny.is_none()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.iter().map(ToString::to_string).collect()
    }
}

impl<'a> FromIterator<&'a Artifact> for ArtifactNames {
    fn from_iter<T: IntoIterator<Item = &'a Artifact>>(iter: T) -> Self {
        let mut names = Self::default();
        for artifact in iter {
            names.insert(artifact.kind, artifact.name.clone());
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn upstream(urls: &[&str], endpoints: &[&str]) -> ProtectedUpstream {
        ProtectedUpstream::new(
            0,
            "requirer",
            urls.iter().map(ToString::to_string).collect(),
            endpoints.iter().map(ToString::to_string).collect(),
            vec!["X-User".to_string()],
        )
        .expect("upstream must be valid")
    }

    fn ids(rules: &[AccessRule]) -> Vec<&str> {
        rules.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn allow_and_deny_rules() {
        let rules = synthesize(&upstream(&["https://example.com"], &["welcome", "about/app"]));

        assert_eq!(
            ids(&rules.allow),
            vec!["requirer:welcome:0:allow", "requirer:about/app:0:allow"]
        );
        assert_eq!(ids(&rules.deny), vec!["requirer:0:deny"]);

        assert_eq!(
            rules.allow[0],
            AccessRule {
                id: "requirer:welcome:0:allow".to_string(),
                matches: RuleMatch {
                    url: "<https|http>://example.com/welcome".to_string(),
                    methods: vec!["GET", "POST", "OPTION", "PUT", "PATCH", "DELETE"]
                        .into_iter()
                        .map(Into::into)
                        .collect(),
                },
                authenticators: vec![Handler {
                    handler: HandlerName::Noop
                }],
                mutators: vec![Handler {
                    handler: HandlerName::Noop
                }],
                authorizer: Handler {
                    handler: HandlerName::Allow
                },
                errors: vec![Handler {
                    handler: HandlerName::Json
                }],
            }
        );

        let deny = &rules.deny[0];
        assert_eq!(
            deny.matches.url,
            "<https|http>://example.com/<(?!(?:welcome|about/app)(?:/|$)).*>"
        );
        assert_eq!(deny.authenticators[0].handler, HandlerName::CookieSession);
        assert_eq!(deny.mutators[0].handler, HandlerName::Header);
        assert_eq!(deny.authorizer.handler, HandlerName::Allow);
        assert_eq!(deny.errors[0].handler, HandlerName::Redirect);
    }

    #[test]
    fn synthesis_is_deterministic() {
        let upstream = upstream(
            &["https://example.com", "http://other.example.com/app"],
            &["welcome", "about/app"],
        );
        let first = synthesize(&upstream);
        let second = synthesize(&upstream);
        assert_eq!(first, second);
        assert_eq!(
            first.clone().into_artifacts("requirer").unwrap(),
            second.into_artifacts("requirer").unwrap()
        );
    }

    #[test]
    fn no_allowed_endpoints_protects_everything() {
        let rules = synthesize(&upstream(&["https://example.com"], &[]));
        assert!(rules.allow.is_empty());
        assert_eq!(rules.deny.len(), 1);
        assert_eq!(rules.deny[0].matches.url, "<https|http>://example.com/<.*>");

        let artifacts = rules.into_artifacts("requirer").unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].kind, RuleKind::Deny);
        assert_eq!(artifacts[0].name, "access-rules-requirer-deny.json");
    }

    #[test]
    fn one_deny_rule_per_url() {
        let rules = synthesize(&upstream(
            &[
                "https://a.example.com",
                "https://b.example.com",
                "http://c.example.com",
            ],
            &["welcome"],
        ));
        assert_eq!(
            ids(&rules.deny),
            vec!["requirer:0:deny", "requirer:1:deny", "requirer:2:deny"]
        );
        assert_eq!(
            ids(&rules.allow),
            vec![
                "requirer:welcome:0:allow",
                "requirer:welcome:1:allow",
                "requirer:welcome:2:allow"
            ]
        );
        assert_eq!(
            rules.deny[2].matches.url,
            "http://c.example.com/<(?!(?:welcome)(?:/|$)).*>"
        );
    }

    #[test]
    fn normalizes_urls() {
        assert_eq!(
            normalize_url("https://example.com"),
            "<https|http>://example.com"
        );
        assert_eq!(
            normalize_url("https://example.com/"),
            normalize_url("https://example.com")
        );
        assert_eq!(
            normalize_url("https://example.com/https/app/"),
            "<https|http>://example.com/https/app"
        );
        assert_eq!(normalize_url("http://example.com/"), "http://example.com");
    }

    #[test]
    fn trailing_slash_yields_same_rules() {
        assert_eq!(
            synthesize(&upstream(&["https://example.com/"], &["welcome"])),
            synthesize(&upstream(&["https://example.com"], &["welcome"]))
        );
    }

    #[test]
    fn escapes_excluded_endpoints() {
        let rules = synthesize(&upstream(&["https://example.com"], &["v1.0/docs", "a+b"]));
        assert_eq!(
            rules.deny[0].matches.url,
            r"<https|http>://example.com/<(?!(?:v1\.0/docs|a\+b)(?:/|$)).*>"
        );
        // Allow rules match the endpoint literally.
        assert_eq!(
            rules.allow[0].matches.url,
            "<https|http>://example.com/v1.0/docs"
        );
    }

    /// Compiles a rule URL the way Oathkeeper's `regexp` matching strategy does: text outside
    /// `<>` is literal, text inside is a regular expression, and the whole URL is anchored.
    fn compile(pattern: &str) -> fancy_regex::Regex {
        let mut re = String::from("^");
        let mut rest = pattern;
        while let Some((literal, tail)) = rest.split_once('<') {
            let (expr, tail) = tail.split_once('>').expect("unbalanced delimiters");
            re.push_str(&regex::escape(literal));
            re.push('(');
            re.push_str(expr);
            re.push(')');
            rest = tail;
        }
        re.push_str(&regex::escape(rest));
        re.push('$');
        fancy_regex::Regex::new(&re).expect("pattern must compile")
    }

    #[test]
    fn deny_rule_excludes_allowed_paths() {
        let rules = synthesize(&upstream(
            &["https://example.com"],
            &["welcome", "about/app", "v1.0"],
        ));
        let deny = compile(&rules.deny[0].matches.url);

        for path in [
            "/welcome",
            "/welcome/",
            "/welcome/x",
            "/about/app",
            "/about/app/y",
            "/v1.0",
        ] {
            let url = format!("https://example.com{path}");
            assert!(!deny.is_match(&url).unwrap(), "{url} must not be denied");
        }
        for path in ["/", "/welcomeback", "/about", "/other", "/v1x0", "/x/welcome"] {
            for scheme in ["http", "https"] {
                let url = format!("{scheme}://example.com{path}");
                assert!(deny.is_match(&url).unwrap(), "{url} must be denied");
            }
        }
        assert!(!deny.is_match("https://other.example.com/x").unwrap());

        let allow = compile(&rules.allow[0].matches.url);
        assert!(allow.is_match("http://example.com/welcome").unwrap());
        assert!(!allow.is_match("https://example.com/welcome/x").unwrap());
    }

    #[test]
    fn deny_rule_without_exclusions_matches_every_path() {
        let rules = synthesize(&upstream(&["https://example.com/app/"], &[]));
        let deny = compile(&rules.deny[0].matches.url);
        for url in ["https://example.com/app/", "http://example.com/app/x/y"] {
            assert!(deny.is_match(url).unwrap(), "{url} must be denied");
        }
        assert!(!deny.is_match("https://example.com/other").unwrap());
    }

    #[test]
    fn artifacts_are_json_rule_lists() {
        let rules = synthesize(&upstream(&["https://example.com"], &["welcome"]));
        let artifacts = rules.clone().into_artifacts("requirer").unwrap();
        assert_eq!(
            artifacts
                .iter()
                .map(|a| (a.kind, a.name.as_str()))
                .collect::<Vec<_>>(),
            vec![
                (RuleKind::Allow, "access-rules-requirer-allow.json"),
                (RuleKind::Deny, "access-rules-requirer-deny.json"),
            ]
        );

        let allow: Vec<AccessRule> = serde_json::from_str(&artifacts[0].content).unwrap();
        assert_eq!(allow, rules.allow);

        let deny: serde_json::Value = serde_json::from_str(&artifacts[1].content).unwrap();
        assert_eq!(deny[0]["id"], "requirer:0:deny");
        assert_eq!(deny[0]["authenticators"][0]["handler"], "cookie_session");
        assert_eq!(deny[0]["match"]["methods"][2], "OPTION");

        let names = artifacts.iter().collect::<ArtifactNames>();
        assert_eq!(
            names.to_vec(),
            vec![
                "access-rules-requirer-allow.json",
                "access-rules-requirer-deny.json"
            ]
        );
    }
}
