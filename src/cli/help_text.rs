pub(super) const ROOT_LONG_ABOUT: &str = "\
Mediated, auditable filesystem access for local assistants

Sandward is the trust boundary between an assistant and the files it works on. Every
path is resolved against a sandbox root, writes are staged as reviewable proposals before
anything touches disk, and a hash-pinned manifest detects and repairs tampering.

CORE CONCEPTS:

  Sandbox root:
    The directory given with -C (or the current directory). Paths that climb out of it
    with '..', absolute paths elsewhere, and symlinks pointing outside are all rejected.

  Proposals:
    'propose' records an intended write as a content-addressed proposal with a full
    before/after diff. Nothing is written until 'apply' is run with the proposal id.
    Proposals live in <STATE_DIR>/proposals/<ID>.toml.

  Drift:
    If the target file changed between 'propose' and 'apply', apply refuses to write.
    Re-propose against the new content instead.

  Integrity manifest:
    <STATE_DIR>/manifest records the hash of every tracked file, pinned to a reference
    tarball whose own hash is recorded too. 'verify' checks the tarball first and only
    then trusts the per-file hashes; 'restore' repairs files from the tarball.

TYPICAL WORKFLOW:

  1. Stage a change:
     $ sandward -C /path/to/project propose notes.txt --content 'hello'

  2. Review the printed diff, then commit it:
     $ sandward -C /path/to/project apply <ID>

  3. Record a known-good state:
     $ sandward manifest

  4. Later, check for tampering and repair:
     $ sandward verify
     $ sandward restore --dry-run
     $ sandward restore

EXIT CODES:

  0    Success
  1    Verification found problems, or a dry-run restore has work to do
  255  Any error (rejected path, drift, I/O failure, invalid arguments)

For detailed help on any command, use:
  sandward <command> --help
";

pub(super) const PROPOSE_LONG_ABOUT: &str = "\
Stage a write without touching the target

Resolves PATH inside the sandbox, hashes the current file (if any) and the proposed
content, and stores a proposal whose id is derived from both. The target file is never
modified by this command.

Proposing the exact same change twice returns the same id. Proposing content identical to
what the file already holds is an error: a proposal must change something.

The printed diff is a full replacement: every current line is shown as removed and every
proposed line as added, so reviewers always see the complete before and after.

EXAMPLES:

  $ sandward propose src/config.txt --content 'debug = true'
  $ sandward propose README.md --from-file /tmp/new-readme.md
";

pub(super) const APPLY_LONG_ABOUT: &str = "\
Commit a staged proposal to disk

Loads the proposal, re-resolves its path inside the sandbox, and re-hashes the target.
If the target no longer has the content the proposal was made against, apply fails with
a drift error and leaves the file alone.

When the sandbox is inside a git work tree, the stored diff is applied with 'git apply'
and the result is checked against the proposed content hash. Otherwise (or with
--no-git, or if git fails) the content is written to a temporary file in the same
directory, synced, and renamed over the target, so a partially written file is never
visible. Existing files keep their permission bits.

Applying a proposal that is already in effect succeeds without writing anything.
";

pub(super) const VERIFY_LONG_ABOUT: &str = "\
Verify tracked files against the integrity manifest

Verification proceeds in layers and stops at the first layer that fails:

  1. The manifest must exist (a missing manifest is a warning) and parse.
  2. It must name a reference tarball.
  3. The tarball must exist and match its recorded SHA-256.
  4. Every tracked file is then checked: missing files and files whose content hash
     differs from the manifest are reported.

Exits with status 0 when every tracked file verified, 1 when anything was reported.
";

pub(super) const RESTORE_LONG_ABOUT: &str = "\
Restore tracked files from the reference tarball

Without PATHS, runs verification first and restores exactly the files it reports as
missing or modified. With PATHS, restores only those files. Other files in the tarball
are never touched.

The tarball's hash is checked before extraction. Archive members with absolute names or
names that climb out with '..' abort the restore, as does any destination that resolves
outside the sandbox. Each restored file must match its manifest hash and gets the
permission bits recorded in the archive.

If a restore fails partway, the files restored before the failure are printed.

EXAMPLES:

  $ sandward restore --dry-run
  $ sandward restore
  $ sandward restore src/main.rs
";

pub(super) const MANIFEST_LONG_ABOUT: &str = "\
Write a reference tarball and an integrity manifest

Packs FILES (or every regular file in the sandbox outside the state directory) into a
gzip tarball and writes a manifest recording each file's hash, size, mode and mtime along
with the tarball's own hash. Both are written atomically. Run this when the tree is in a
known-good state.

MANIFEST FORMAT:

  # comment
  VERSION <version> <schema_version> <root_id>
  TARBALL <sha256> <size> <path>
  FILE <sha256> <size> <octal-mode> <rfc3339-mtime> <path>
";
