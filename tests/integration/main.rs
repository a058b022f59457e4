//! Integration tests for upstack

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Self-contained environment: config file, database, cache, and user
    /// tag directories all under one temp root
    struct TestEnv {
        root: TempDir,
        config: PathBuf,
    }

    fn setup() -> TestEnv {
        let root = TempDir::new().unwrap();
        let db = root.path().join("db");
        let cache = root.path().join("cache");
        let usertags = root.path().join("usertags");
        fs::create_dir_all(&db).unwrap();
        fs::create_dir_all(&cache).unwrap();
        fs::create_dir_all(&usertags).unwrap();

        let config = root.path().join("config.toml");
        fs::write(
            &config,
            format!(
                "[database]\npath = {db:?}\n\n[cache]\ndir = {cache:?}\nuser_tag_dir = {usertags:?}\n\n[flavor]\nnative = \"Linux64\"\nfallbacks = []\n",
                db = db,
                cache = cache,
                usertags = usertags,
            ),
        )
        .unwrap();

        TestEnv { root, config }
    }

    fn upstack(env: &TestEnv) -> Command {
        let mut cmd = cargo_bin_cmd!("upstack");
        cmd.env("UPSTACK_CONFIG", &env.config);
        cmd
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("upstack")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("product-stack registry cache"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("upstack")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("upstack"));
    }

    #[test]
    fn missing_database_fails_fast() {
        let env = setup();
        upstack(&env)
            .args(["list", "--db"])
            .arg(env.root.path().join("no-such-db"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("database directory not found"));
    }

    #[test]
    fn declare_then_list() {
        let env = setup();
        upstack(&env)
            .args([
                "declare", "astro", "1.0", "--flavor", "Linux64", "--tag", "current",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Declared astro 1.0 for Linux64"));

        upstack(&env)
            .args(["list"])
            .assert()
            .success()
            .stdout(
                predicate::str::contains("astro")
                    .and(predicate::str::contains("1.0"))
                    .and(predicate::str::contains("current")),
            );
    }

    #[test]
    fn tag_untag_cycle() {
        let env = setup();
        upstack(&env)
            .args(["declare", "astro", "1.0"])
            .assert()
            .success();

        upstack(&env)
            .args(["tag", "stable", "astro", "1.0"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Tagged astro 1.0 as stable"));

        upstack(&env)
            .args(["tags"])
            .assert()
            .success()
            .stdout(predicate::str::contains("stable"));

        upstack(&env)
            .args(["untag", "stable", "astro"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Removed tag stable"));

        upstack(&env)
            .args(["untag", "stable", "astro"])
            .assert()
            .success()
            .stdout(predicate::str::contains("was not assigned"));
    }

    #[test]
    fn tag_unknown_product_fails() {
        let env = setup();
        upstack(&env)
            .args(["tag", "current", "ghost", "1.0"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Product not found"));
    }

    #[test]
    fn undeclare_removes_product() {
        let env = setup();
        upstack(&env)
            .args(["declare", "astro", "1.0"])
            .assert()
            .success();

        upstack(&env)
            .args(["undeclare", "astro", "1.0"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Undeclared astro 1.0"));

        upstack(&env)
            .args(["list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("astro").not());
    }

    #[test]
    fn cache_lifecycle() {
        let env = setup();
        upstack(&env)
            .args(["declare", "astro", "1.0"])
            .assert()
            .success();

        upstack(&env)
            .args(["cache", "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("fresh"));

        upstack(&env)
            .args(["cache", "clear"])
            .assert()
            .success();

        upstack(&env)
            .args(["cache", "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("missing"));

        upstack(&env)
            .args(["cache", "rebuild"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Rebuilt snapshots"));

        upstack(&env)
            .args(["cache", "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("fresh"));
    }

    #[test]
    fn flavors_lists_native_chain() {
        let env = setup();
        upstack(&env)
            .args(["declare", "astro", "1.0"])
            .assert()
            .success();

        upstack(&env)
            .args(["flavors"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Linux64"));
    }

    #[test]
    fn user_tag_stays_out_of_shared_snapshot() {
        let env = setup();
        upstack(&env)
            .args(["declare", "astro", "1.0"])
            .assert()
            .success();
        upstack(&env)
            .args(["tag", "user.mine", "astro", "1.0"])
            .assert()
            .success();

        let snapshot = env.root.path().join("cache").join("Linux64.cacheDB1_0_0");
        let content = fs::read_to_string(snapshot).unwrap();
        assert!(!content.contains("user.mine"));

        let overlay = env
            .root
            .path()
            .join("usertags")
            .join("Linux64_user.mine.cacheTag1_0_0");
        let content = fs::read_to_string(overlay).unwrap();
        assert!(content.contains("astro"));
    }
}
