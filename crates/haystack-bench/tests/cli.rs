//! Command-line parsing and configuration layering

use clap::Parser;
use haystack::DepthMode;
use haystack_bench::cli::{Cli, Command};
use haystack_bench::BenchConfig;

#[test]
fn run_flags_map_to_overrides() {
    let cli = Cli::try_parse_from([
        "haystack-bench",
        "--verbose",
        "run",
        "--source",
        "novel.txt",
        "--questions",
        "q.jsonl",
        "--output",
        "out.jsonl",
        "--mode",
        "Fixed",
        "--context-lengths",
        "1000,4000",
        "--fixed-depth",
        "0.5",
        "--limit",
        "20",
        "--seed",
        "7",
        "--ignore-invalid",
    ])
    .unwrap();
    assert!(cli.verbose);

    let Command::Run(args) = cli.command else {
        panic!("expected run subcommand");
    };
    let inputs = args.inputs.to_inputs();
    assert!(inputs.ignore_invalid);
    assert!(!inputs.skip_validation);

    let overrides = args.settings.to_overrides(5);
    assert_eq!(overrides.mode, Some(DepthMode::Fixed));
    assert_eq!(overrides.context_lengths, Some(vec![1_000, 4_000]));
    assert_eq!(overrides.fixed_depth, Some(0.5));
    assert_eq!(overrides.sample_limit, Some(20));
    assert_eq!(overrides.sample_seed, Some(7));
    assert_eq!(overrides.concurrency, Some(5));
    assert_eq!(overrides.padding_size, None);
}

#[test]
fn recover_requires_prior() {
    let missing = Cli::try_parse_from([
        "haystack-bench",
        "recover",
        "--source",
        "novel.txt",
        "--questions",
        "q.jsonl",
        "--output",
        "out.jsonl",
    ]);
    assert!(missing.is_err());

    let cli = Cli::try_parse_from([
        "haystack-bench",
        "recover",
        "--prior",
        "old.jsonl",
        "--source",
        "novel.txt",
        "--questions",
        "q.jsonl",
        "--output",
        "out.jsonl",
        "--concurrency",
        "2",
    ])
    .unwrap();
    let Command::Recover(args) = cli.command else {
        panic!("expected recover subcommand");
    };
    assert_eq!(args.prior.to_str(), Some("old.jsonl"));
    assert_eq!(args.settings.to_overrides(5).concurrency, Some(2));
    assert_eq!(args.settings.to_overrides(5).context_lengths, None);
}

#[test]
fn unknown_mode_is_a_parse_error() {
    let parsed = Cli::try_parse_from([
        "haystack-bench",
        "run",
        "--source",
        "s",
        "--questions",
        "q",
        "--output",
        "o",
        "--mode",
        "spiral",
    ]);
    assert!(parsed.is_err());
}

fn valid_config() -> BenchConfig {
    BenchConfig {
        api_key: "sk-test-0123456789".to_string(),
        model_name: "gpt-test".to_string(),
        ..BenchConfig::default()
    }
}

#[test]
fn toml_file_overlays_environment_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.toml");
    std::fs::write(
        &path,
        "model_name = \"from-file\"\ntemperature = 0.0\nconcurrency = 16\n",
    )
    .unwrap();

    let config = valid_config().merge_file(&path).unwrap();
    assert_eq!(config.model_name, "from-file");
    assert_eq!(config.temperature, 0.0);
    assert_eq!(config.concurrency, 16);
    assert_eq!(config.api_key, "sk-test-0123456789");
    assert_eq!(config.max_tokens, 2000);
    config.validate().unwrap();
}

#[test]
fn unknown_toml_keys_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.toml");
    std::fs::write(&path, "modle_name = \"typo\"\n").unwrap();
    assert!(valid_config().merge_file(&path).is_err());
}

#[test]
fn validation_rejects_bad_values() {
    valid_config().validate().unwrap();

    let cases = [
        BenchConfig {
            api_key: " ".to_string(),
            ..valid_config()
        },
        BenchConfig {
            model_name: String::new(),
            ..valid_config()
        },
        BenchConfig {
            temperature: 2.5,
            ..valid_config()
        },
        BenchConfig {
            max_tokens: 0,
            ..valid_config()
        },
        BenchConfig {
            timeout_secs: 0,
            ..valid_config()
        },
        BenchConfig {
            concurrency: 0,
            ..valid_config()
        },
    ];
    for config in cases {
        assert!(config.validate().is_err(), "{config:?}");
    }
}

#[test]
fn redacted_view_hides_the_key() {
    let view = valid_config().redacted();
    assert_eq!(view["api_key"], "***6789");
    assert_eq!(view["model_name"], "gpt-test");
    assert!(!view.to_string().contains("sk-test"));
}
