/// Git metadata captured at build time. Every field is optional because the
/// crate may be built from a source tarball without a repository.
pub(crate) struct BuildInfo {
    pub commit_sha1: Option<&'static str>,
    pub branch: Option<&'static str>,
    git_dirty: Option<&'static str>,
}

impl BuildInfo {
    pub fn is_dirty(&self) -> bool {
        self.git_dirty == Some("true")
    }
}

pub(crate) const BUILD_INFO: BuildInfo = BuildInfo {
    commit_sha1: option_env!("VERGEN_GIT_SHA"),
    branch: option_env!("VERGEN_GIT_BRANCH"),
    git_dirty: option_env!("VERGEN_GIT_DIRTY"),
};
