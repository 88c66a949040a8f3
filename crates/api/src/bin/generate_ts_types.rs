// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

// Allowed: This is a CLI code generation tool, not server code.
// Using println! for progress output is appropriate here.
#![allow(clippy::disallowed_macros)]

use std::fs;
use std::path::Path;
use ts_rs::TS;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let declarations = vec![
        // detkit-core types
        format!("// detkit-core\nexport {}", detkit_core::Detection::decl()),
        format!("export {}", detkit_core::DetectionResult::decl()),
        format!("export {}", detkit_core::FrameMetricRecord::decl()),
        format!("export {}", detkit_core::BandwidthSample::decl()),
        format!("export {}", detkit_core::Percentiles::decl()),
        format!("export {}", detkit_core::StreamStats::decl()),
        format!("export {}", detkit_core::SummaryStats::decl()),
        format!("export {}", detkit_core::LatencyStats::decl()),
        format!("export {}", detkit_core::BandwidthStats::decl()),
        format!("export {}", detkit_core::MetricsSnapshot::decl()),
        format!("export {}", detkit_core::RecentStats::decl()),
        // detkit-api types
        format!("\n// detkit-api\nexport {}", detkit_api::Mode::decl()),
        format!("export {}", detkit_api::SdpType::decl()),
        format!("export {}", detkit_api::SessionDescription::decl()),
        format!("export {}", detkit_api::IceCandidateInit::decl()),
        format!("export {}", detkit_api::OfferRequest::decl()),
        format!("export {}", detkit_api::OfferResponse::decl()),
        format!("export {}", detkit_api::IceCandidateRequest::decl()),
        format!("export {}", detkit_api::SuccessResponse::decl()),
        format!("export {}", detkit_api::ErrorResponse::decl()),
        format!("export {}", detkit_api::HealthResponse::decl()),
        format!("export {}", detkit_api::ModeResponse::decl()),
        format!("export {}", detkit_api::FrameMetricReport::decl()),
        format!("export {}", detkit_api::BandwidthReport::decl()),
        format!("export {}", detkit_api::DetectRequest::decl()),
        format!("export {}", detkit_api::ClientMessage::decl()),
        format!("export {}", detkit_api::ServerMessage::decl()),
    ];

    let output = declarations.join("\n\n");
    let content = format!("// This file is auto-generated. Do not edit it manually.\n\n{output}");

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let workspace_root = manifest_dir
        .parent()
        .and_then(|parent| parent.parent())
        .ok_or("Failed to find workspace root from CARGO_MANIFEST_DIR")?;
    let output_dir = workspace_root.join("web/src/types/generated");
    fs::create_dir_all(&output_dir)?;
    let output_path = output_dir.join("api-types.ts");

    println!("Writing TypeScript bindings to: {}", output_path.display());

    fs::write(&output_path, content)?;

    println!("✅ TypeScript bindings generated successfully.");

    Ok(())
}
