use crate::{
    execution_rules::ExecutionRules,
    route::Route,
    trie::Trie,
};
use http_types::{Method, StatusCode};
use trellis::{Context, FrameworkError, Reporter};
use trellis_http::is_loopback_subdomain;

/// The literal subdomain that matches any non-empty subdomain which is
/// not the application's configured host.
pub const SUBDOMAIN_WILDCARD_INDICATOR: &str = "*.";

/**
The router runtime: builds the `(method, subdomain)`-keyed search trees
from the route set and dispatches incoming requests onto handler
chains. Built once (under the router's lock), then read without
locking while serving.
*/
#[derive(Debug, Default)]
pub struct RouterHandler {
    trees: Vec<Trie>,
    // true if at least one route is keyed under a subdomain
    hosts: bool,
}

impl RouterHandler {
    /// Construct an empty router runtime.
    pub fn new() -> Self {
        Self::default()
    }

    fn tree_mut(&mut self, method: Method, subdomain: &str) -> &mut Trie {
        if let Some(index) = self
            .trees
            .iter()
            .position(|trie| trie.method() == method && trie.subdomain() == subdomain)
        {
            return &mut self.trees[index];
        }

        self.trees.push(Trie::new(method, subdomain));
        self.trees
            .last_mut()
            .expect("just pushed a tree")
    }

    fn add_route(&mut self, route: &Route) -> Result<(), FrameworkError> {
        let method = route
            .method()
            .ok_or_else(|| FrameworkError::new(format!("route {route} is offline")))?;

        self.tree_mut(method, &route.subdomain).insert(
            &route.path,
            &route.name,
            route.handlers.clone(),
        );
        Ok(())
    }

    /**
    Build the search trees from the provided route set.

    Routes are sorted so that more specific registrations insert first:
    longer subdomains first, then (within one method and subdomain
    length) more path segments first, then parameterized paths before
    their static siblings. Offline routes are skipped. Per-route
    failures are aggregated and returned combined.
    */
    pub fn build(
        &mut self,
        routes: &mut [Route],
        rules: &ExecutionRules,
    ) -> Result<(), FrameworkError> {
        self.trees.truncate(0);
        self.hosts = false;

        routes.sort_by(|a, b| {
            use std::cmp::Ordering;

            let sub_a = a.subdomain.len();
            let sub_b = b.subdomain.len();

            if sub_a == sub_b && a.method() == b.method() {
                let slashes_a = a.path.matches('/').count();
                let slashes_b = b.path.matches('/').count();

                if slashes_b < slashes_a {
                    // wildcard roots must not shadow deeper paths
                    return Ordering::Less;
                }
                if slashes_b == slashes_a {
                    // static paths insert after their parameterized
                    // siblings with the same prefix
                    if a.tmpl().params.is_empty() {
                        return Ordering::Greater;
                    }
                    if b.tmpl().params.is_empty() {
                        return Ordering::Less;
                    }
                }
            }

            sub_b.cmp(&sub_a)
        });

        let reporter = Reporter::new();

        for route in routes.iter_mut() {
            if !route.is_online() {
                continue;
            }

            route.prepare(rules);

            if !route.subdomain.is_empty() {
                self.hosts = true;
            }

            if let Err(error) = self.add_route(route) {
                reporter.add(format!("{error} -> {route}"));
                continue;
            }

            log::debug!("{}", route.trace());
        }

        match reporter.return_err() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn subdomain_gate(&self, ctx: &Context, trie: &Trie) -> bool {
        if !self.hosts || trie.subdomain().is_empty() {
            return true;
        }

        let request_host = ctx.host();
        if is_loopback_subdomain(request_host) {
            // listening on 127.0.0.1 with a wildcard subdomain and a
            // root-domain route would otherwise misroute
            return false;
        }

        if trie.subdomain() == SUBDOMAIN_WILDCARD_INDICATOR {
            let server_host = ctx.application().configuration().vhost.as_str();
            if server_host == request_host {
                // a full domain, not a subdomain of it
                return false;
            }

            let dot = request_host.find('.');
            let slash = request_host.find('/');
            match dot {
                Some(dot) if dot > 0 && slash.map(|s| s > dot).unwrap_or(true) => true,
                _ => false,
            }
        } else {
            // the registered subdomain contains its dot
            request_host.starts_with(trie.subdomain())
        }
    }

    /**
    Dispatch the context: path correction first, then the matching
    method tree gated by subdomain, then the trie search. A hit records
    the route name and runs the handler chain; a miss answers 405 (when
    enabled and another method matches) or 404.
    */
    pub async fn handle_request(&self, ctx: &mut Context) {
        let method = ctx.method();
        let mut path = String::from(ctx.path());

        let (disable_correction, disable_redirection, fire_method_not_allowed) = {
            let config = ctx.application().configuration();
            (
                config.disable_path_correction,
                config.disable_path_correction_redirection,
                config.fire_method_not_allowed,
            )
        };

        if !disable_correction && path.len() > 1 && path.ends_with('/') {
            // trim to a single canonical form to avoid an open
            // redirect through a double leading slash
            path = format!("/{}", path.trim_matches('/'));
            ctx.request_mut().set_path(&path);

            if !disable_redirection {
                let url = {
                    let query = ctx.request().query();
                    if query.is_empty() {
                        path.clone()
                    } else {
                        format!("{path}?{query}")
                    }
                };

                // a permanent redirect must not replay a POST body
                // (rfc 7231, 6.4.7), use 307 there
                if method == Method::Post || method == Method::Put {
                    ctx.redirect(&url, Some(StatusCode::TemporaryRedirect));
                    return;
                }

                ctx.redirect(&url, Some(StatusCode::MovedPermanently));

                if method == Method::Get {
                    let note = format!(
                        "<a href=\"{}\">Moved Permanently</a>.\n",
                        html_escape(&url)
                    );
                    let _ = ctx.write_string(&note).await;
                }
                return;
            }
        }

        for trie in &self.trees {
            if trie.method() != method {
                continue;
            }
            if !self.subdomain_gate(ctx, trie) {
                continue;
            }

            let hit = trie
                .search(&path, ctx.params_mut())
                .map(|node| (String::from(node.route_name()), node.handlers().clone()));

            match hit {
                Some((route_name, handlers)) => {
                    ctx.set_current_route_name(route_name);
                    ctx.do_handlers(handlers).await;
                    return;
                }
                // not found, or only another method matches
                None => break,
            }
        }

        if fire_method_not_allowed {
            for trie in &self.trees {
                if !self.tree_matches(ctx, trie, None, &path) {
                    continue;
                }
                // rfc 2616 requires an Allow header listing valid
                // methods alongside a 405
                let allow = trie.method().to_string();
                ctx.header("allow", &allow);
                ctx.status_code(StatusCode::MethodNotAllowed);
                return;
            }
        }

        ctx.status_code(StatusCode::NotFound);
    }

    fn tree_matches(
        &self,
        ctx: &mut Context,
        trie: &Trie,
        method: Option<Method>,
        path: &str,
    ) -> bool {
        if let Some(method) = method {
            if method != trie.method() {
                return false;
            }
        }

        if !self.subdomain_gate(ctx, trie) {
            return false;
        }

        trie.search(path, ctx.params_mut()).is_some()
    }

    /// Whether a route exists for the method and path, searching from
    /// the context's host for subdomain routes. Does not invoke
    /// handlers.
    pub fn route_exists(&self, ctx: &mut Context, method: Method, path: &str) -> bool {
        self.trees
            .iter()
            .any(|trie| self.tree_matches(ctx, trie, Some(method), path))
    }
}

fn html_escape(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
