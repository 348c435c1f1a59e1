use http_types::Method;
use std::collections::HashMap;
use trellis::{Handlers, RequestParams};

use crate::path::{PARAM_START, WILDCARD_PARAM_START};

pub(crate) const PARAM_KEY: &str = ":";
pub(crate) const WILDCARD_KEY: &str = "*";

/**
A node of the search trie. Nodes live in their trie's arena and refer
to each other by index; the parent index is only read (never rewritten)
after insert, when the search walks upward for wildcard back-off.
*/
#[derive(Default)]
pub struct TrieNode {
    parent: Option<usize>,
    children: HashMap<String, usize>,

    has_dynamic_child: bool,
    child_named_parameter: bool,
    child_wildcard_parameter: bool,

    param_keys: Vec<String>,

    end: bool,
    key: String,
    // the path up to the first dynamic character, used to bind the
    // remainder on wildcard back-off
    static_key: String,

    pub(crate) handlers: Handlers,
    pub(crate) route_name: String,
}

impl std::fmt::Debug for TrieNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrieNode")
            .field("key", &self.key)
            .field("end", &self.end)
            .field("children", &self.children.len())
            .finish()
    }
}

impl TrieNode {
    /// The route name bound to this node, when terminal.
    pub fn route_name(&self) -> &str {
        &self.route_name
    }

    /// The handler chain bound to this node, when terminal.
    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    /// The original registration path, when terminal.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/**
One search tree. Each `(method, subdomain)` pair owns an independent
trie; matching prefers literal over named over wildcard children at
every step, with back-off to the nearest wildcard ancestor on a dead
end.
*/
pub struct Trie {
    nodes: Vec<TrieNode>,
    // a wildcard registered at depth one handles any path that
    // nothing else claims
    has_root_wildcard: bool,
    has_root_slash: bool,
    pub(crate) method: Method,
    pub(crate) subdomain: String,
}

impl std::fmt::Debug for Trie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trie")
            .field("method", &self.method)
            .field("subdomain", &self.subdomain)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

fn slow_path_split(path: &str) -> Vec<&str> {
    if path == "/" {
        vec!["/"]
    } else {
        path.split('/').skip(1).collect()
    }
}

impl Trie {
    /// Construct an empty trie for the `(method, subdomain)` pair.
    pub fn new(method: Method, subdomain: &str) -> Self {
        Self {
            nodes: vec![TrieNode::default()],
            has_root_wildcard: false,
            has_root_slash: false,
            method,
            subdomain: String::from(subdomain),
        }
    }

    /// The method this trie serves.
    pub fn method(&self) -> Method {
        self.method
    }

    /// The subdomain this trie is keyed under.
    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    fn child(&self, node: usize, key: &str) -> Option<usize> {
        self.nodes[node].children.get(key).copied()
    }

    fn add_child(&mut self, node: usize, key: &str) -> usize {
        if let Some(existing) = self.child(node, key) {
            return existing;
        }
        let index = self.nodes.len();
        self.nodes.push(TrieNode {
            parent: Some(node),
            ..TrieNode::default()
        });
        self.nodes[node].children.insert(String::from(key), index);
        index
    }

    fn closest_parent_wildcard(&self, node: usize) -> Option<usize> {
        let mut current = self.nodes[node].parent;
        while let Some(parent) = current {
            if self.nodes[parent].child_wildcard_parameter {
                return self.child(parent, WILDCARD_KEY);
            }
            current = self.nodes[parent].parent;
        }
        None
    }

    /**
    Insert a route's path into this trie, creating static children
    keyed by literal and named/wildcard children under their sentinel
    keys. The terminal node records the route name, its handler chain,
    and the ordered parameter names.
    */
    pub fn insert(&mut self, path: &str, route_name: &str, handlers: Handlers) {
        let input = slow_path_split(path);

        let mut node = 0;
        if path == "/" {
            self.has_root_slash = true;
        }

        let mut param_keys = Vec::new();

        for segment in input {
            let first = segment.chars().next().unwrap_or_default();
            let key = if first == PARAM_START {
                self.nodes[node].has_dynamic_child = true;
                self.nodes[node].child_named_parameter = true;
                param_keys.push(String::from(&segment[1..]));
                PARAM_KEY
            } else if first == WILDCARD_PARAM_START {
                self.nodes[node].has_dynamic_child = true;
                self.nodes[node].child_wildcard_parameter = true;
                param_keys.push(String::from(&segment[1..]));
                if node == 0 {
                    self.has_root_wildcard = true;
                }
                WILDCARD_KEY
            } else {
                segment
            };

            node = self.add_child(node, key);
        }

        let static_end = path
            .find(PARAM_START)
            .or_else(|| path.find(WILDCARD_PARAM_START))
            .unwrap_or(path.len());

        let terminal = &mut self.nodes[node];
        terminal.route_name = String::from(route_name);
        terminal.handlers = handlers;
        terminal.param_keys = param_keys;
        terminal.key = String::from(path);
        terminal.end = true;
        terminal.static_key = String::from(&path[..static_end]);
    }

    /**
    Search for `q`, binding any parameter values into `params`.

    Literal children win over the named child, which wins over the
    wildcard child; a dead end backs off to the nearest ancestor with a
    wildcard child, binding the remainder of `q` relative to that
    ancestor's static prefix.
    */
    pub fn search(&self, q: &str, params: &mut RequestParams) -> Option<&TrieNode> {
        let end = q.len();

        if end == 0 || (end == 1 && q.as_bytes()[0] == b'/') {
            // fixes root wildcard when no / was registered
            if self.has_root_slash {
                return self.child(0, "/").map(|index| &self.nodes[index]);
            } else if self.has_root_wildcard {
                let index = self.child(0, WILDCARD_KEY)?;
                let node = &self.nodes[index];
                params.set(node.param_keys.first()?.clone(), "");
                return Some(node);
            }
            return None;
        }

        let bytes = q.as_bytes();
        let mut node = 0;
        let mut start = 1;
        let mut i = 1;
        let mut param_values: Vec<String> = Vec::new();

        loop {
            if i == end || bytes[i] == b'/' {
                if let Some(child) = self.child(node, &q[start..i]) {
                    node = child;
                } else if self.nodes[node].child_named_parameter {
                    node = self.child(node, PARAM_KEY)?;
                    param_values.push(String::from(&q[start..i]));
                } else if self.nodes[node].child_wildcard_parameter {
                    node = self.child(node, WILDCARD_KEY)?;
                    param_values.push(String::from(&q[start..]));
                    break;
                } else {
                    // the named path led somewhere the request does
                    // not follow; back off to the nearest wildcard
                    // ancestor instead of not-found
                    return self.closest_parent_wildcard(node).map(|index| {
                        let wildcard = &self.nodes[index];
                        let from = wildcard.static_key.len().min(end);
                        if let Some(key) = wildcard.param_keys.first() {
                            params.set(key.clone(), &q[from..]);
                        }
                        wildcard
                    });
                }

                if i == end {
                    break;
                }

                i += 1;
                start = i;
                continue;
            }

            i += 1;
        }

        if !self.nodes[node].end {
            if let Some(index) = self.closest_parent_wildcard(node) {
                let wildcard = &self.nodes[index];
                let from = wildcard.static_key.len().min(end);
                if let Some(key) = wildcard.param_keys.first() {
                    params.set(key.clone(), &q[from..]);
                }
                return Some(wildcard);
            }

            if self.has_root_wildcard {
                let index = self.child(0, WILDCARD_KEY)?;
                let wildcard = &self.nodes[index];
                params.set(wildcard.param_keys.first()?.clone(), &q[1..]);
                return Some(wildcard);
            }

            return None;
        }

        let found = &self.nodes[node];
        for (index, value) in param_values.into_iter().enumerate() {
            if let Some(key) = found.param_keys.get(index) {
                params.set(key.clone(), value);
            }
        }

        Some(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use trellis::{handler, Context, Handler};

    fn noop() -> Arc<dyn Handler> {
        handler(|_ctx: &mut Context| -> trellis::BoxFuture<'_, ()> { Box::pin(async {}) })
    }

    fn trie_with(paths: &[&str]) -> Trie {
        let mut trie = Trie::new(Method::Get, "");
        for path in paths {
            trie.insert(path, path, vec![noop()]);
        }
        trie
    }

    fn search<'a>(trie: &'a Trie, q: &str, params: &mut RequestParams) -> Option<&'a str> {
        trie.search(q, params).map(TrieNode::route_name)
    }

    #[test]
    fn literal_beats_named_beats_wildcard() {
        let trie = trie_with(&["/assets/*path", "/assets/static", "/hello/:name"]);
        let mut params = RequestParams::new();

        assert_eq!(search(&trie, "/assets/static", &mut params), Some("/assets/static"));
        assert!(params.is_empty());

        assert_eq!(search(&trie, "/assets/foo/bar", &mut params), Some("/assets/*path"));
        assert_eq!(params.get("path"), Some("foo/bar"));

        params.reset();
        assert_eq!(search(&trie, "/hello/ada", &mut params), Some("/hello/:name"));
        assert_eq!(params.get("name"), Some("ada"));
    }

    #[test]
    fn wildcard_back_off_from_named_branch() {
        let trie = trie_with(&["/hello/*p", "/hello/:p1/static/:p2"]);
        let mut params = RequestParams::new();

        assert_eq!(
            search(&trie, "/hello/a/static/b", &mut params),
            Some("/hello/:p1/static/:p2")
        );
        assert_eq!(params.get("p1"), Some("a"));
        assert_eq!(params.get("p2"), Some("b"));

        params.reset();
        assert_eq!(search(&trie, "/hello/a", &mut params), Some("/hello/*p"));
        assert_eq!(params.get("p"), Some("a"));

        params.reset();
        assert_eq!(search(&trie, "/hello/a/static/b/c", &mut params), Some("/hello/*p"));
        assert_eq!(params.get("p"), Some("a/static/b/c"));
    }

    #[test]
    fn root_wildcard_handles_everything_unclaimed() {
        let trie = trie_with(&["/*any", "/other/static"]);
        let mut params = RequestParams::new();

        assert_eq!(search(&trie, "/other/static", &mut params), Some("/other/static"));

        assert_eq!(search(&trie, "/anything/at/all", &mut params), Some("/*any"));
        assert_eq!(params.get("any"), Some("anything/at/all"));

        params.reset();
        assert_eq!(search(&trie, "/", &mut params), Some("/*any"));
        assert_eq!(params.get("any"), Some(""));
    }

    #[test]
    fn root_slash_wins_over_root_wildcard() {
        let trie = trie_with(&["/", "/*any"]);
        let mut params = RequestParams::new();
        assert_eq!(search(&trie, "/", &mut params), Some("/"));
        assert_eq!(search(&trie, "/something", &mut params), Some("/*any"));
    }

    #[test]
    fn insertion_order_does_not_change_specificity() {
        for paths in [
            &["/assets/static", "/assets/*path"][..],
            &["/assets/*path", "/assets/static"][..],
        ] {
            let trie = trie_with(paths);
            let mut params = RequestParams::new();
            assert_eq!(search(&trie, "/assets/static", &mut params), Some("/assets/static"));
            assert_eq!(search(&trie, "/assets/x", &mut params), Some("/assets/*path"));
        }
    }

    #[test]
    fn latest_insert_overwrites_terminal_data() {
        let mut trie = Trie::new(Method::Get, "");
        trie.insert("/dup", "first", vec![noop()]);
        trie.insert("/dup", "second", vec![noop()]);
        let mut params = RequestParams::new();
        assert_eq!(search(&trie, "/dup", &mut params), Some("second"));
    }

    #[test]
    fn no_match() {
        let trie = trie_with(&["/a/b"]);
        let mut params = RequestParams::new();
        assert_eq!(search(&trie, "/a/c", &mut params), None);
        assert_eq!(search(&trie, "/", &mut params), None);
        assert_eq!(search(&trie, "/a/b/c", &mut params), None);
    }
}
