//! End-to-end document analysis with scripted OCR engines.
//!
//! No network or Tesseract: every engine is a mock with a call counter, so
//! these tests also pin down which engines the cascade actually touched.

use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, Rgb, RgbImage};
use rxscan::pipeline::entities::{ExtractionScope, DEDUP_WINDOW};
use rxscan::pipeline::extraction::{
    encode_png, CancellationFlag, CloudVisionAdapter, EngineFailure, EngineId, ExtractionError,
    LocalVisionAdapter, MockBlockRecognizer, MockOcrEngine, MockTranscriber, OcrCascadeController,
    OcrEngineAdapter, OcrWarning, RuleBasedOcrAdapter,
};
use rxscan::pipeline::lab_values::LabFlag;
use rxscan::pipeline::processor::{DocumentAnalyzer, DocumentType, ReferenceData};

fn page() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(120, 90, |x, y| {
        Rgb([(x * 2) as u8, (y * 2) as u8, 180])
    }))
}

/// 2x2-pixel black/white checker: every other neighbour step jumps by 255,
/// far above the stroke irregularity of printed text.
fn irregular_strokes() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(120, 90, |x, y| {
        if (x / 2 + y / 2) % 2 == 0 {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        }
    }))
}

fn analyzer(adapters: Vec<Box<dyn OcrEngineAdapter>>) -> DocumentAnalyzer {
    DocumentAnalyzer::with_reference_data(
        OcrCascadeController::new(adapters),
        &ReferenceData::bundled().unwrap(),
    )
    .unwrap()
}

fn rule_based(engine: &Arc<MockOcrEngine>) -> Box<dyn OcrEngineAdapter> {
    Box::new(RuleBasedOcrAdapter::new(engine.clone()).with_modes(&[6]))
}

fn local(recognizer: &Arc<MockBlockRecognizer>) -> Box<dyn OcrEngineAdapter> {
    Box::new(LocalVisionAdapter::new(recognizer.clone()))
}

fn cloud(transcriber: &Arc<MockTranscriber>) -> Box<dyn OcrEngineAdapter> {
    Box::new(
        CloudVisionAdapter::new(transcriber.clone(), vec!["gemini-test".into()])
            .with_retry_backoff(Duration::ZERO),
    )
}

// ═══════════════════════════════════════════════════════════
// Scenarios
// ═══════════════════════════════════════════════════════════

#[test]
fn printed_prescription_yields_medicine_with_dosage() {
    let tess = Arc::new(MockOcrEngine::new("Betaloc 100mg 1 tab BID", 0.9));
    let a = analyzer(vec![
        Box::new(CloudVisionAdapter::unavailable()),
        Box::new(LocalVisionAdapter::unavailable()),
        rule_based(&tess),
    ]);

    let bytes = encode_png(&page()).unwrap();
    let analysis = a.analyze_bytes(&bytes, &CancellationFlag::new()).unwrap();

    assert_eq!(analysis.ocr_method, EngineId::RuleBased);
    assert!(!analysis.is_handwritten);
    assert_eq!(analysis.medicines.len(), 1);
    let betaloc = &analysis.medicines[0];
    assert_eq!(betaloc.name, "Betaloc");
    let dosage = betaloc.dosage.as_ref().unwrap();
    assert_eq!(dosage.text, "100mg");
    assert_eq!(&analysis.ocr_text[dosage.start..dosage.end], "100mg");
    assert!(betaloc.duration.is_none());
}

#[test]
fn typed_report_without_medicines_is_still_sectioned() {
    let report = "CITY DIAGNOSTIC LABORATORY\n\
        Patient: John Doe Age: 45\n\
        Complete blood count report shows haemoglobin within reference range. \
        White cell count normal and platelets adequate. No abnormal cells were seen \
        on the peripheral smear. Liver function values are within expected limits \
        for the adult reference population and kidney markers look stable.\n\
        Dr. Smith";
    assert!(report.split_whitespace().count() >= 40);

    let tess = Arc::new(MockOcrEngine::new(report, 0.85));
    let a = analyzer(vec![
        Box::new(CloudVisionAdapter::unavailable()),
        Box::new(LocalVisionAdapter::unavailable()),
        rule_based(&tess),
    ]);
    let analysis = a.analyze_image(&page(), &CancellationFlag::new()).unwrap();

    assert_eq!(analysis.ocr_method, EngineId::RuleBased);
    assert!(analysis.ocr_confidence >= 0.85 && analysis.ocr_confidence <= 0.92);
    assert!(analysis.medicines.is_empty());
    assert!(analysis.diagnosis_suggestions.is_none());
    assert_eq!(
        analysis.sections.header.as_deref(),
        Some("CITY DIAGNOSTIC LABORATORY")
    );
    assert!(analysis
        .sections
        .patient_info
        .as_deref()
        .unwrap()
        .starts_with("Patient: John Doe"));
    assert!(analysis.sections.medication_lines.is_empty());
}

#[test]
fn without_cloud_local_model_wins_when_it_clears_threshold() {
    let vision = Arc::new(MockBlockRecognizer::new(&[
        ("Amoxicillin 500mg", 0.30),
        ("1 cap TID for 5 days", 0.26),
    ]));
    let tess = Arc::new(MockOcrEngine::new("unused text here", 0.9));
    let a = analyzer(vec![
        Box::new(CloudVisionAdapter::unavailable()),
        local(&vision),
        rule_based(&tess),
    ]);
    let analysis = a.analyze_image(&page(), &CancellationFlag::new()).unwrap();

    assert_eq!(analysis.ocr_method, EngineId::LocalDeepLearning);
    assert_eq!(vision.calls(), 1);
    assert_eq!(tess.calls(), 0);
    assert!(analysis.is_handwritten);
    assert!(analysis.warnings.contains(&OcrWarning::HandwritingDetected));
    assert_eq!(analysis.medicines[0].name, "Amoxicillin");
    assert!(analysis.summary.starts_with("Handwritten prescription detected"));
}

#[test]
fn without_cloud_rule_based_wins_when_local_falls_short() {
    let vision = Arc::new(MockBlockRecognizer::new(&[("Amoxicillin 500mg", 0.9)]));
    let tess = Arc::new(MockOcrEngine::new("Amoxicillin 500mg 1 cap TID", 0.8));
    let a = analyzer(vec![
        Box::new(CloudVisionAdapter::unavailable()),
        local(&vision),
        rule_based(&tess),
    ]);
    let analysis = a.analyze_image(&page(), &CancellationFlag::new()).unwrap();

    assert_eq!(analysis.ocr_method, EngineId::RuleBased);
    assert_eq!(vision.calls(), 1);
    assert_eq!(tess.calls(), 1);
    assert_eq!(analysis.winning_attempt.engine_id, EngineId::RuleBased);
}

#[test]
fn irregular_strokes_mark_mid_confidence_text_as_handwritten() {
    let text = "Amoxicillin 500mg three times daily for five days";
    let run = |image: &DynamicImage| {
        let tess = Arc::new(MockOcrEngine::new(text, 0.55));
        analyzer(vec![
            Box::new(CloudVisionAdapter::unavailable()),
            Box::new(LocalVisionAdapter::unavailable()),
            rule_based(&tess),
        ])
        .analyze_image(image, &CancellationFlag::new())
        .unwrap()
    };

    let scribbled = run(&irregular_strokes());
    let stroke = scribbled
        .winning_attempt
        .preprocessed_image
        .as_ref()
        .unwrap()
        .stroke_irregularity;
    assert!(stroke > 60.0, "stroke irregularity {stroke}");
    assert_eq!(scribbled.ocr_method, EngineId::RuleBased);
    assert!(scribbled.is_handwritten);
    assert!(scribbled.warnings.contains(&OcrWarning::HandwritingDetected));
    assert!(scribbled.summary.starts_with("Handwritten prescription detected"));

    // Same text and confidence on a smooth page: confidence alone is not enough
    let printed = run(&page());
    assert!(!printed.is_handwritten);
    assert!(!printed.warnings.contains(&OcrWarning::HandwritingDetected));
}

#[test]
fn repeated_medicine_collapses_only_inside_dedup_window() {
    let text = "Metformin 500mg morning. Metformin 500mg evening.\n\
        Continue walking daily and review after the next visit at the clinic.\n\
        Metformin 850mg at night";
    let tess = Arc::new(MockOcrEngine::new(text, 0.9));
    let a = analyzer(vec![rule_based(&tess)]);
    let analysis = a.analyze_image(&page(), &CancellationFlag::new()).unwrap();

    let third = analysis.ocr_text.rfind("Metformin").unwrap();
    assert!(third > DEDUP_WINDOW);

    let records: Vec<(&str, &str)> = analysis
        .medicines
        .iter()
        .map(|m| (m.name.as_str(), m.dosage.as_ref().unwrap().text.as_str()))
        .collect();
    assert_eq!(records, vec![("Metformin", "500mg"), ("Metformin", "850mg")]);
}

#[test]
fn lab_report_routes_to_lab_values() {
    let report = "CITY DIAGNOSTIC LABORATORY\n\
        Hemoglobin 10.9 g/dL\n\
        WBC 7,800 /uL\n\
        Platelets 42 k/uL\n\
        Dr. Smith";
    let tess = Arc::new(MockOcrEngine::new(report, 0.88));
    let a = analyzer(vec![rule_based(&tess)]);
    let analysis = a.analyze_image(&page(), &CancellationFlag::new()).unwrap();

    assert_eq!(analysis.document_type, DocumentType::LabReport);
    assert!(analysis.medicines.is_empty());
    assert!(analysis.diagnosis_suggestions.is_none());
    assert_eq!(analysis.lab_values.len(), 3);
    assert_eq!(analysis.lab_values[1].value, 7800.0);
    assert_eq!(analysis.lab_values[1].flag, LabFlag::Normal);
    assert_eq!(analysis.lab_abnormal_count, 2);
    assert_eq!(
        analysis.lab_critical_flags,
        vec!["CRITICAL: Severe thrombocytopenia - Bleeding risk"]
    );

    let json = serde_json::to_value(&analysis).unwrap();
    assert_eq!(json["document_type"], "lab_report");
    assert_eq!(json["lab_values"][0]["flag"], "low");
}

// ═══════════════════════════════════════════════════════════
// Cascade properties
// ═══════════════════════════════════════════════════════════

#[test]
fn accepted_cloud_result_short_circuits_other_engines() {
    let transcriber = Arc::new(MockTranscriber::always(Ok(
        "Omeprazole 20mg OD before breakfast for 14 days".into(),
    )));
    let vision = Arc::new(MockBlockRecognizer::new(&[("never", 0.9)]));
    let tess = Arc::new(MockOcrEngine::new("never", 0.9));
    let a = analyzer(vec![cloud(&transcriber), local(&vision), rule_based(&tess)]);

    let analysis = a.analyze_image(&page(), &CancellationFlag::new()).unwrap();

    assert_eq!(analysis.ocr_method, EngineId::CloudVision);
    assert_eq!(transcriber.calls(), 1);
    assert_eq!(vision.calls(), 0);
    assert_eq!(tess.calls(), 0);
    assert_eq!(analysis.medicines[0].name, "Omeprazole");
    let conditions = &analysis.diagnosis_suggestions.unwrap().possible_conditions;
    assert!(!conditions.is_empty());
}

#[test]
fn cancellation_during_rate_limit_backoff_abandons_retry() {
    let transcriber = Arc::new(MockTranscriber::scripted(vec![
        Err(EngineFailure::RateLimited),
        Ok("Omeprazole 20mg OD before breakfast for 14 days".into()),
    ]));
    let slow_cloud = CloudVisionAdapter::new(transcriber.clone(), vec!["gemini-test".into()])
        .with_retry_backoff(Duration::from_secs(30));
    let tess = Arc::new(MockOcrEngine::new("never", 0.9));
    let a = analyzer(vec![Box::new(slow_cloud), rule_based(&tess)]);

    let cancel = CancellationFlag::new();
    let remote = cancel.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        remote.cancel();
    });

    let start = std::time::Instant::now();
    let result = a.analyze_image(&page(), &cancel);
    canceller.join().unwrap();

    assert!(matches!(result, Err(ExtractionError::Cancelled)));
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(transcriber.calls(), 1);
    assert_eq!(tess.calls(), 0);
}

#[test]
fn every_engine_failing_still_returns_a_result() {
    let transcriber = Arc::new(MockTranscriber::always(Err(EngineFailure::Auth(401))));
    let vision = Arc::new(MockBlockRecognizer::failing(EngineFailure::Timeout(120)));
    let tess = Arc::new(MockOcrEngine::failing());
    let a = analyzer(vec![cloud(&transcriber), local(&vision), rule_based(&tess)]);

    let analysis = a.analyze_image(&page(), &CancellationFlag::new()).unwrap();

    assert_eq!(analysis.ocr_text, "");
    assert_eq!(analysis.ocr_confidence, 0.0);
    assert!(analysis.quality_warning.is_some());
    assert!(analysis.warnings.contains(&OcrWarning::NoTextExtracted));
    assert!(analysis.medicines.is_empty());
    assert!(!analysis.winning_attempt.succeeded);
}

#[test]
fn cancellation_aborts_without_partial_result() {
    let tess = Arc::new(MockOcrEngine::new("Betaloc 100mg", 0.9));
    let a = analyzer(vec![rule_based(&tess)]);
    let cancel = CancellationFlag::new();
    cancel.cancel();

    let result = a.analyze_image(&page(), &cancel);
    assert!(matches!(result, Err(ExtractionError::Cancelled)));
    assert_eq!(tess.calls(), 0);
}

#[test]
fn medication_zone_scope_falls_back_to_full_text() {
    let tess = Arc::new(MockOcrEngine::new("Metformin given earlier this year", 0.9));
    let a = analyzer(vec![rule_based(&tess)]).with_scope(ExtractionScope::MedicationZone);
    let analysis = a.analyze_image(&page(), &CancellationFlag::new()).unwrap();

    assert_eq!(analysis.extraction_scope, ExtractionScope::FullText);
    assert_eq!(analysis.medicines[0].name, "Metformin");
}

#[test]
fn analysis_json_carries_audit_trail() {
    let tess = Arc::new(MockOcrEngine::new("Atenolol 50mg once daily", 0.9));
    let a = analyzer(vec![rule_based(&tess)]);
    let analysis = a.analyze_image(&page(), &CancellationFlag::new()).unwrap();

    let json = serde_json::to_value(&analysis).unwrap();
    assert_eq!(json["winning_attempt"]["engine_id"], "rule-based");
    assert_eq!(json["winning_attempt"]["succeeded"], true);
    assert_eq!(json["extraction_scope"], "full-text");
    assert!(json["analysis_id"].is_string());
    assert!(json["diagnosis_suggestions"]["disclaimer"]
        .as_str()
        .unwrap()
        .contains("Doctor verification required"));
}
