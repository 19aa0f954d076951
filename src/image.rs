use regex::Regex;
use std::sync::LazyLock;

static HAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\p{Han}").expect("valid regex"));

/// Branch and tag names end up in image references and CI arguments,
/// neither of which accept ideographs.
pub fn contains_ideographic(s: &str) -> bool {
    HAN.is_match(s)
}

pub mod name {
    /// Where an artifact's image lives inside the container registry.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ImageLocation {
        /// `registry-host/git-directory`, also the registry project path.
        pub registry: String,
        /// `registry-host/git-directory/git-repo-name`
        pub image: String,
    }

    impl ImageLocation {
        /// Derive the registry path and image reference from a git URL and a registry URL.
        pub fn resolve(git_url: &str, registry_url: &str) -> Self {
            let (directory, name) = git_directory_and_name(git_url);
            let host = strip_scheme(registry_url).trim_end_matches('/');
            let registry = format!("{host}/{directory}");
            let image = format!("{registry}/{name}");
            Self { registry, image }
        }
    }

    /// Split a registry path into `(host, project)`.
    pub fn registry_project(registry: &str) -> (&str, &str) {
        match registry.split_once('/') {
            Some((host, rest)) => (host, rest.split('/').next().unwrap_or_default()),
            None => (registry, ""),
        }
    }

    pub fn strip_scheme(url: &str) -> &str {
        let url = url.trim();
        url.strip_prefix("http://")
            .or_else(|| url.strip_prefix("https://"))
            .unwrap_or(url)
    }

    /// `("team", "app.git")` for `git.example.com/team/app.git`.
    /// Both are empty unless the path has at least a host, a directory and a name.
    pub fn git_directory_and_name(git_url: &str) -> (&str, &str) {
        let segments: Vec<&str> = strip_scheme(git_url).split('/').collect();
        match segments.as_slice() {
            [_, .., directory, name] => (*directory, *name),
            _ => ("", ""),
        }
    }
}

pub mod tag {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    const TAG_LENGTH: usize = 12;

    /// Random lower case tag for requests that do not name one.
    pub fn generate() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TAG_LENGTH)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect()
    }
}
