//! Benchmarks for output repair
//!
//! This benchmark measures:
//! - Stripping leaked tool-call markup per defect pattern
//! - The clean-text fast path
//! - Lenient JSON recovery of tool arguments

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use ai_gateway::repair::json::parse_lenient;
use ai_gateway::repair::{repair, repair_all_known, DefectPattern, KnownDefect};

const ANSWER: &str = "The capital of Norway is Oslo. It sits at the head of the Oslofjord \
and has a population of roughly 700,000 people.";

fn samples() -> Vec<(&'static str, KnownDefect, String)> {
    vec![
        (
            "xml_tool_call",
            KnownDefect::XmlToolCall,
            format!("{}\n\n<tool_call>{{\"name\": \"search\", \"arguments\": {{\"q\": \"oslo\"}}}}</tool_call>", ANSWER),
        ),
        (
            "python_tag",
            KnownDefect::PythonTag,
            format!("{}<|python_tag|>search.call(query=\"oslo\")", ANSWER),
        ),
        (
            "mistral_tool_calls",
            KnownDefect::MistralToolCalls,
            format!("{}[TOOL_CALLS][{{\"name\": \"search\"}}]", ANSWER),
        ),
        (
            "think_block",
            KnownDefect::ThinkBlock,
            format!("<think>The user wants the capital.\n\n\nRecall facts.</think>\n{}", ANSWER),
        ),
        (
            "template_tokens",
            KnownDefect::TemplateTokens,
            format!("{}<|eot_id|><|im_end|>", ANSWER),
        ),
    ]
}

fn bench_single_defect(c: &mut Criterion) {
    let mut group = c.benchmark_group("repair");

    for (name, defect, text) in samples() {
        let defects = [DefectPattern::from(defect)];
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::new("single", name), &text, |b, text| {
            b.iter(|| repair(black_box(text), &defects))
        });
    }

    let clean = ANSWER.repeat(20);
    group.throughput(Throughput::Bytes(clean.len() as u64));
    group.bench_with_input(BenchmarkId::new("all_known", "clean"), &clean, |b, text| {
        b.iter(|| repair_all_known(black_box(text)))
    });

    let dirty: String = samples().into_iter().map(|(_, _, t)| t).collect::<Vec<_>>().join("\n");
    group.throughput(Throughput::Bytes(dirty.len() as u64));
    group.bench_with_input(BenchmarkId::new("all_known", "mixed"), &dirty, |b, text| {
        b.iter(|| repair_all_known(black_box(text)))
    });

    group.finish();
}

fn bench_lenient_json(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_lenient");

    let inputs = [
        ("valid", r#"{"location": "Tokyo", "unit": "celsius"}"#.to_string()),
        (
            "fenced",
            "Here you go:\n```json\n{\"location\": \"Tokyo\", \"unit\": \"celsius\",}\n```".to_string(),
        ),
        ("truncated", r#"{"location": "Tokyo", "filters": ["a", "b""#.to_string()),
    ];
    for (name, input) in &inputs {
        group.bench_with_input(BenchmarkId::from_parameter(name), input, |b, input| {
            b.iter(|| parse_lenient(black_box(input)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_single_defect, bench_lenient_json);
criterion_main!(benches);
