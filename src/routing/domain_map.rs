//! Host+path → route lookup with atomic hot reload.
//!
//! # Responsibilities
//! - Build a route set from a routes file or in-memory lines
//! - Look up the best route for (host, path)
//! - Replace the whole set atomically on reload
//! - Notify observers after every successful change
//!
//! # Design Decisions
//! - Lookup order: exact host beats wildcard; within a host, longest
//!   path prefix wins; remaining ties go to the earlier line
//! - A reload failure keeps the previous set; in-flight sessions keep
//!   the `Arc<Route>` they captured regardless
//! - Bad lines are skipped with a warning rather than failing the file,
//!   so one typo cannot take the proxy's routing down on SIGHUP

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::routing::route::{Route, RouteParseError};

/// An immutable, compiled set of routes.
#[derive(Debug, Default)]
pub struct RouteSet {
    routes: Vec<Arc<Route>>,
}

impl RouteSet {
    pub fn from_lines<'a, I: IntoIterator<Item = &'a str>>(lines: I) -> RouteSet {
        let mut routes = Vec::new();

        for (lineno, line) in lines.into_iter().enumerate() {
            match Route::parse_line(line) {
                Ok(Some(route)) => routes.push(Arc::new(route)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(lineno = lineno + 1, error = %e, "skipping bad route line");
                }
            }
        }

        RouteSet { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Find the best route for a request.
    pub fn lookup(&self, host: &str, path: &str) -> Option<Arc<Route>> {
        let mut best: Option<&Arc<Route>> = None;

        for route in &self.routes {
            if !route.matches_host(host) || !route.matches_path(path) {
                continue;
            }

            let better = match best {
                None => true,
                Some(current) => {
                    let exact_new = route.host != "*";
                    let exact_cur = current.host != "*";

                    if exact_new != exact_cur {
                        exact_new
                    } else {
                        // first-wins on equal length: strictly longer only
                        route.path_prefix.len() > current.path_prefix.len()
                    }
                }
            };

            if better {
                best = Some(route);
            }
        }

        best.cloned()
    }
}

enum Source {
    File(PathBuf),
    Lines(Vec<String>),
}

/// The shared routing table. Workers hold an `Arc<DomainMap>`; each
/// session captures an `Arc<Route>` at routing time.
pub struct DomainMap {
    current: RwLock<Arc<RouteSet>>,
    source: Mutex<Source>,
    observers: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl DomainMap {
    /// Load from a routes file.
    pub fn from_file(path: impl Into<PathBuf>) -> io::Result<DomainMap> {
        let path = path.into();
        let set = load_file(&path)?;

        tracing::info!(path = %path.display(), routes = set.len(), "routes loaded");

        Ok(DomainMap {
            current: RwLock::new(Arc::new(set)),
            source: Mutex::new(Source::File(path)),
            observers: Mutex::new(Vec::new()),
        })
    }

    /// Build from in-memory route lines (`--route` overrides).
    pub fn from_lines(lines: &[String]) -> DomainMap {
        let set = RouteSet::from_lines(lines.iter().map(String::as_str));

        DomainMap {
            current: RwLock::new(Arc::new(set)),
            source: Mutex::new(Source::Lines(lines.to_vec())),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Append one route line and rebuild. Only valid for line-sourced
    /// maps; file-sourced maps change through their file.
    pub fn add_route_line(&self, line: &str) -> Result<(), RouteParseError> {
        // validate before committing
        Route::parse_line(line)?;

        let mut source = self.source.lock().unwrap();
        match &mut *source {
            Source::Lines(lines) => {
                lines.push(line.to_string());
                let set = RouteSet::from_lines(lines.iter().map(String::as_str));
                *self.current.write().unwrap() = Arc::new(set);
            }
            Source::File(_) => {
                tracing::warn!("add_route_line ignored for file-sourced map");
                return Ok(());
            }
        }
        drop(source);

        self.notify();
        Ok(())
    }

    /// The current snapshot. Sessions route against one snapshot and
    /// never re-route.
    pub fn snapshot(&self) -> Arc<RouteSet> {
        self.current.read().unwrap().clone()
    }

    /// Convenience lookup against the current snapshot.
    pub fn lookup(&self, host: &str, path: &str) -> Option<Arc<Route>> {
        self.snapshot().lookup(host, path)
    }

    /// Re-read the source and swap the snapshot atomically. On IO error
    /// the previous snapshot stays.
    pub fn reload(&self) -> io::Result<usize> {
        let source = self.source.lock().unwrap();
        let set = match &*source {
            Source::File(path) => load_file(path)?,
            Source::Lines(lines) => RouteSet::from_lines(lines.iter().map(String::as_str)),
        };
        drop(source);

        let count = set.len();
        *self.current.write().unwrap() = Arc::new(set);

        tracing::info!(routes = count, "routes reloaded");
        self.notify();

        Ok(count)
    }

    /// Register a callback to run after every successful change. Fired
    /// from whichever thread performed the change.
    pub fn on_changed(&self, f: impl Fn() + Send + Sync + 'static) {
        self.observers.lock().unwrap().push(Box::new(f));
    }

    fn notify(&self) {
        for observer in self.observers.lock().unwrap().iter() {
            observer();
        }
    }
}

fn load_file(path: &Path) -> io::Result<RouteSet> {
    let content = std::fs::read_to_string(path)?;
    Ok(RouteSet::from_lines(content.lines()))
}
