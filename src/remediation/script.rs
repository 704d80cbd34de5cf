//! Seeding script and environment for a remediation sandbox
//!
//! The script text is a constant. Everything that varies per attempt,
//! credentials included, reaches it through environment bindings so nothing
//! sensitive appears in the sandbox's argument list.

use crate::config::RemediationConfig;

use super::Credentials;

/// Shell entrypoint the script is handed to.
pub const ENTRYPOINT: [&str; 2] = ["/bin/sh", "-c"];

/// POSIX sh job: clone, run the coding agent, commit/push if anything
/// changed, report back, exit with the agent's status.
pub const SEED_SCRIPT: &str = r#"echo "=== REMEDIATION $REMEDIATION_ID STARTED ==="
echo "Service: $SERVICE_NAME"
echo "Repository: $REPO_URL"

if ! command -v git >/dev/null 2>&1; then
    echo "=== INSTALLING GIT ==="
    if command -v apk >/dev/null 2>&1; then
        apk add --no-cache git >/dev/null
    elif command -v apt-get >/dev/null 2>&1; then
        apt-get update >/dev/null && apt-get install -y git >/dev/null
    fi
fi

echo "=== CONFIGURING AGENT ==="
PROVIDER="${AGENT_MODEL%%/*}"
MODEL_ID="${AGENT_MODEL#*/}"
mkdir -p "$HOME/.config/opencode"
cat > "$HOME/.config/opencode/opencode.json" <<CONFIGEOF
{
  "\$schema": "https://opencode.ai/config.json",
  "model": "$AGENT_MODEL",
  "provider": {
    "$PROVIDER": {
      "api": "openai",
      "name": "$PROVIDER",
      "models": { "$MODEL_ID": { "id": "$MODEL_ID", "name": "$MODEL_ID" } },
      "options": {
        "baseURL": "$AGENT_BASE_URL",
        "apiKey": "{env:AGENT_API_KEY}"
      }
    }
  }
}
CONFIGEOF

echo "=== CLONING ==="
mkdir -p /workspace
cd /workspace || exit 1
REPO_PATH=$(printf '%s' "$REPO_URL" | sed -e 's|^https://||' -e 's|^http://||')
if ! git clone "https://x-access-token:${SCM_TOKEN}@${REPO_PATH}" repo; then
    echo "clone failed"
    exit 2
fi
cd /workspace/repo || exit 1
git checkout -b "$BRANCH_NAME"
git config user.name "$GIT_AUTHOR_NAME"
git config user.email "$GIT_AUTHOR_EMAIL"

echo "=== RUNNING AGENT ==="
PROMPT="The service $SERVICE_NAME is failing with the following error:

$ERROR_LOG

Find the root cause in this repository and make the smallest code change that fixes it.
Do not commit, push or create branches."
AGENT_EXIT=0
opencode run "$PROMPT" 2>&1 || AGENT_EXIT=$?

echo "=== CHECKING FOR CHANGES ==="
CHANGES=$(git status --porcelain)
COMMIT_HASH=""
PUSHED=false
if [ -n "$CHANGES" ]; then
    git add -A
    git commit -q -m "fix: automated remediation for $SERVICE_NAME"
    COMMIT_HASH=$(git rev-parse HEAD)
    git push -q origin "$BRANCH_NAME" && PUSHED=true
else
    echo "No changes were made by the agent."
fi

if [ -n "$COMMIT_HASH" ] && [ "$PUSHED" = true ]; then
    SUCCESS=true
    SUMMARY="Applied and pushed fix to branch $BRANCH_NAME"
else
    SUCCESS=false
    SUMMARY="No fix pushed (agent exit $AGENT_EXIT)"
fi

FILES=$(printf '%s\n' "$CHANGES" | awk 'NF { printf "%s\"%s\"", sep, $NF; sep="," }')
REPORT=$(printf '{"remediation_id":"%s","success":%s,"summary":"%s","files_changed":[%s],"commit_hash":"%s","pushed":%s,"logs":"agent exit %s"}' \
    "$REMEDIATION_ID" "$SUCCESS" "$SUMMARY" "$FILES" "$COMMIT_HASH" "$PUSHED" "$AGENT_EXIT")

echo "=== REPORTING TO $CALLBACK_URL ==="
if command -v curl >/dev/null 2>&1; then
    curl -fsS -X POST -H 'Content-Type: application/json' --data "$REPORT" \
        "$CALLBACK_URL/api/remediation/report" || echo "report failed"
else
    wget -qO- --header='Content-Type: application/json' --post-data="$REPORT" \
        "$CALLBACK_URL/api/remediation/report" || echo "report failed"
fi

echo "=== REMEDIATION $REMEDIATION_ID COMPLETE ==="
exit $AGENT_EXIT
"#;

/// Per-attempt values bound into the sandbox environment
#[derive(Debug, Clone, Copy)]
pub struct SeedContext<'a> {
    pub remediation_id: &'a str,
    pub service_name: &'a str,
    pub repo_url: &'a str,
    pub error_log: &'a str,
}

/// Branch the sandbox pushes its fix to.
pub fn branch_name(prefix: &str, remediation_id: &str) -> String {
    format!("{prefix}-{remediation_id}")
}

/// Environment bindings for one attempt.
pub fn seed_env(
    ctx: &SeedContext<'_>,
    settings: &RemediationConfig,
    credentials: &Credentials,
) -> Vec<(String, String)> {
    let pairs: [(&str, &str); 14] = [
        ("SCM_TOKEN", credentials.scm_token()),
        ("AGENT_API_KEY", credentials.agent_api_key()),
        ("GIT_AUTHOR_NAME", settings.author_name.as_str()),
        ("GIT_AUTHOR_EMAIL", settings.author_email.as_str()),
        ("GIT_COMMITTER_NAME", settings.author_name.as_str()),
        ("GIT_COMMITTER_EMAIL", settings.author_email.as_str()),
        ("REMEDIATION_ID", ctx.remediation_id),
        ("SERVICE_NAME", ctx.service_name),
        ("REPO_URL", ctx.repo_url),
        ("CALLBACK_URL", settings.callback_url.trim_end_matches('/')),
        ("ERROR_LOG", ctx.error_log),
        ("AGENT_MODEL", settings.agent_model.as_str()),
        ("AGENT_BASE_URL", settings.agent_base_url.as_str()),
        ("TERM", "dumb"),
    ];
    let mut env: Vec<(String, String)> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    env.push((
        "BRANCH_NAME".to_string(),
        branch_name(&settings.branch_prefix, ctx.remediation_id),
    ));
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
        env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_env_carries_every_binding() {
        let creds = Credentials::new("ghp_token", "agent-key");
        let settings = RemediationConfig {
            callback_url: "http://host.docker.internal:8080/".to_string(),
            ..RemediationConfig::default()
        };
        let ctx = SeedContext {
            remediation_id: "abcd1234",
            service_name: "svc-a",
            repo_url: "https://example/x/y",
            error_log: "it's broken; rm -rf /",
        };
        let env = seed_env(&ctx, &settings, &creds);

        assert_eq!(lookup(&env, "SCM_TOKEN"), Some("ghp_token"));
        assert_eq!(lookup(&env, "AGENT_API_KEY"), Some("agent-key"));
        assert_eq!(lookup(&env, "BRANCH_NAME"), Some("autofix-abcd1234"));
        assert_eq!(lookup(&env, "CALLBACK_URL"), Some("http://host.docker.internal:8080"));
        assert_eq!(lookup(&env, "ERROR_LOG"), Some("it's broken; rm -rf /"));
        assert_eq!(lookup(&env, "TERM"), Some("dumb"));
        assert_eq!(lookup(&env, "GIT_COMMITTER_NAME"), lookup(&env, "GIT_AUTHOR_NAME"));
    }

    #[test]
    fn test_script_reads_values_from_environment_only() {
        for var in [
            "$SCM_TOKEN",
            "$REMEDIATION_ID",
            "$ERROR_LOG",
            "$BRANCH_NAME",
            "$CALLBACK_URL/api/remediation/report",
        ] {
            let bare = var.trim_start_matches('$');
            assert!(
                SEED_SCRIPT.contains(var) || SEED_SCRIPT.contains(&format!("${{{bare}}}")),
                "script does not reference {var}"
            );
        }
        assert!(SEED_SCRIPT.contains("\\$schema"));
        assert!(!SEED_SCRIPT.contains("ghp_"));
    }
}
