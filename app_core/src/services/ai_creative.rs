use std::time::Duration;

use base64::engine::general_purpose;
use base64::Engine as _;
use rand::Rng;
use serde_json::{json, Value};

use crate::config::JobConfig;
use crate::contracts::{JobError, JobResult};
use crate::data_models::winner::{CreativeType, GeneratedCreative};
use crate::services::supabase::SupabaseService;
use crate::utils::images::normalize_to_pin_png;

const IMAGE_MODEL: &str = "gpt-image-1";
const VIDEO_MODEL: &str = "veo-3.1-generate-preview";
const VIDEO_POLL_BUDGET: Duration = Duration::from_secs(300);

/// Result of one generation batch. `api_limit_reached` stops further
/// generation of that modality for the run; partial output is still used.
#[derive(Debug, Default)]
pub struct CreativeGenerationResult {
    pub creatives: Vec<GeneratedCreative>,
    pub api_limit_reached: bool,
    pub error_message: Option<String>,
}

impl CreativeGenerationResult {
    fn from_errors(errors: Vec<String>, creatives: Vec<GeneratedCreative>) -> Self {
        Self {
            creatives,
            api_limit_reached: false,
            error_message: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        }
    }
}

/// Client for the AI creative APIs: the image-edit/generate endpoint and
/// the asynchronous video-generation endpoint.
pub struct AiCreativeService {
    client: reqwest::Client,
    openai_api_base: String,
    openai_api_key: Option<String>,
    genai_api_base: String,
    google_api_key: Option<String>,
    poll_interval: Duration,
}

impl AiCreativeService {
    pub fn new(config: &JobConfig) -> JobResult<Self> {
        if config.openai_api_key.is_none() {
            log::warn!(target: "ai_creative", "image API key not set, image generation disabled");
        }
        if config.google_api_key.is_none() {
            log::warn!(target: "ai_creative", "video API key not set, video generation disabled");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| JobError::fatal(format!("could not build creative client: {}", e)))?;

        Ok(Self {
            client,
            openai_api_base: config.openai_api_base.clone(),
            openai_api_key: config.openai_api_key.clone(),
            genai_api_base: config.genai_api_base.clone(),
            google_api_key: config.google_api_key.clone(),
            poll_interval: Duration::from_secs(10),
        })
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn creative_path(prefix: &str, extension: &str) -> String {
        let stamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let salt: u32 = rand::thread_rng().gen();
        format!("{}/{:x}{:08x}.{}", prefix, stamp, salt, extension)
    }

    fn is_quota_error(message: &str) -> bool {
        let lower = message.to_lowercase();
        lower.contains("429") || lower.contains("rate") || lower.contains("quota")
    }

    async fn download(&self, url: &str) -> JobResult<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(JobError::quota("429 while downloading asset"));
        }
        if !response.status().is_success() {
            return Err(JobError::transient(format!(
                "asset download failed: {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    // ===== Images =====

    fn image_prompt(product_title: &str, custom_prompt: Option<&str>, index: usize) -> String {
        let base = match custom_prompt {
            Some(prompt) if !prompt.trim().is_empty() => prompt.to_string(),
            _ => format!(
                "Create a high-quality, pin-optimized product advertisement image of the \
                 following item. The product must exactly match the reference image; no \
                 changes in color, design, shape or texture. Product title: {}. Vertical \
                 2:3 format, professional e-commerce photography, soft lighting, clean \
                 minimal composition, neutral elegant background, no text or logos.",
                product_title
            ),
        };

        let variation = match index {
            0 => "Clean, minimalist style with soft lighting.",
            1 => "Lifestyle setting showing the product in use.",
            2 => "Close-up detail shot highlighting quality.",
            _ => "Elegant product photography with subtle shadows.",
        };
        format!("{} Variation {}: {}", base, index + 1, variation)
    }

    /// One image-API call. Uses the edit endpoint when a reference image is
    /// available, the pure generation endpoint otherwise. Returns base64 or
    /// a download URL, whichever the API produced.
    async fn call_image_api(
        &self,
        prompt: &str,
        reference_image: Option<&[u8]>,
    ) -> JobResult<String> {
        let api_key = self
            .openai_api_key
            .as_ref()
            .ok_or_else(|| JobError::validation("image API key not configured"))?;

        let response = match reference_image {
            Some(image_bytes) => {
                let form = reqwest::multipart::Form::new()
                    .text("model", IMAGE_MODEL)
                    .text("prompt", prompt.to_string())
                    .text("size", "1024x1536")
                    .text("quality", "high")
                    .text("n", "1")
                    .part(
                        "image",
                        reqwest::multipart::Part::bytes(image_bytes.to_vec())
                            .file_name("reference.png")
                            .mime_str("image/png")
                            .map_err(|e| JobError::validation(format!("bad mime: {}", e)))?,
                    );
                self.client
                    .post(format!("{}/images/edits", self.openai_api_base))
                    .bearer_auth(api_key)
                    .multipart(form)
                    .send()
                    .await?
            }
            None => {
                self.client
                    .post(format!("{}/images/generations", self.openai_api_base))
                    .bearer_auth(api_key)
                    .json(&json!({
                        "model": IMAGE_MODEL,
                        "prompt": prompt,
                        "size": "1024x1536",
                        "quality": "high",
                        "n": 1,
                    }))
                    .send()
                    .await?
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(JobError::quota("image API rate limit reached"));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("image API error {}: {}", status, text);
            if Self::is_quota_error(&message) {
                return Err(JobError::quota(message));
            }
            return Err(JobError::transient(message));
        }

        let body: Value = response.json().await?;
        let data = body
            .pointer("/data/0")
            .ok_or_else(|| JobError::validation("image API returned no data"))?;
        data.get("b64_json")
            .and_then(|v| v.as_str())
            .or_else(|| data.get("url").and_then(|v| v.as_str()))
            .map(|v| v.to_string())
            .ok_or_else(|| JobError::validation("image API returned neither b64 nor url"))
    }

    /// Generates `count` pin images for a product, normalises each to
    /// 1000x1500 PNG and uploads to the public creative bucket.
    pub async fn generate_images(
        &self,
        store: &SupabaseService,
        bucket: &str,
        product_title: &str,
        product_image_url: Option<&str>,
        count: u32,
        custom_prompt: Option<&str>,
    ) -> CreativeGenerationResult {
        if self.openai_api_key.is_none() {
            return CreativeGenerationResult::from_errors(
                vec!["image API key not configured".to_string()],
                Vec::new(),
            );
        }

        let reference = match product_image_url {
            Some(url) => match self.download(url).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    log::warn!(target: "ai_creative", "reference image unavailable: {}", e);
                    None
                }
            },
            None => None,
        };

        let mut creatives = Vec::new();
        let mut errors = Vec::new();

        for index in 0..count as usize {
            let prompt = Self::image_prompt(product_title, custom_prompt, index);

            let result = self.call_image_api(&prompt, reference.as_deref()).await;
            let payload = match result {
                Ok(payload) => payload,
                Err(e) if e.kind == crate::contracts::JobErrorKind::QuotaExceeded => {
                    return CreativeGenerationResult {
                        creatives,
                        api_limit_reached: true,
                        error_message: Some(e.message),
                    };
                }
                Err(e) => {
                    errors.push(format!("image {}: {}", index + 1, e.message));
                    continue;
                }
            };

            let raw_bytes = if payload.starts_with("http") {
                match self.download(&payload).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        errors.push(format!("image {}: {}", index + 1, e.message));
                        continue;
                    }
                }
            } else {
                match general_purpose::STANDARD.decode(&payload) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        errors.push(format!("image {}: bad base64: {}", index + 1, e));
                        continue;
                    }
                }
            };

            let normalized = match normalize_to_pin_png(&raw_bytes) {
                Ok(bytes) => bytes,
                Err(e) => {
                    errors.push(format!("image {}: {}", index + 1, e.message));
                    continue;
                }
            };

            let path = Self::creative_path("winner-images", "png");
            match store
                .upload_to_storage(bucket, &path, normalized, "image/png")
                .await
            {
                Ok(url) => {
                    log::info!(target: "ai_creative", "generated image {}/{}", index + 1, count);
                    creatives.push(GeneratedCreative {
                        url,
                        creative_type: CreativeType::Image,
                        model: IMAGE_MODEL.to_string(),
                        prompt_used: Some(prompt.chars().take(500).collect()),
                        pin_id: None,
                    });
                }
                Err(e) => errors.push(format!("image {}: upload failed: {}", index + 1, e.message)),
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        CreativeGenerationResult::from_errors(errors, creatives)
    }

    // ===== Videos =====

    fn video_prompt(product_title: &str, custom_prompt: Option<&str>, index: usize) -> String {
        let base = match custom_prompt {
            Some(prompt) if !prompt.trim().is_empty() => prompt.to_string(),
            _ => format!(
                "Create an 8-second vertical product showcase video featuring the exact \
                 product shown in the reference image; the design, colors and textures \
                 must match perfectly. Product title: {}. Aspect ratio 9:16, elegant \
                 minimal background, smooth professional camera movement, studio \
                 lighting, no text or music cues.",
                product_title
            ),
        };

        let variation = if index == 0 {
            "Slow camera movement revealing the product with elegant transitions."
        } else {
            "Dynamic showcase with product rotating and lifestyle scenes."
        };
        format!("{} {}", base, variation)
    }

    /// One async video generation: start the operation, poll until done
    /// within the budget, download the artifact.
    async fn call_video_api(
        &self,
        prompt: &str,
        reference_image: Option<&[u8]>,
    ) -> JobResult<Vec<u8>> {
        let api_key = self
            .google_api_key
            .as_ref()
            .ok_or_else(|| JobError::validation("video API key not configured"))?;

        let mut instance = json!({"prompt": prompt});
        if let Some(image_bytes) = reference_image {
            instance["image"] = json!({
                "bytesBase64Encoded": general_purpose::STANDARD.encode(image_bytes),
                "mimeType": "image/jpeg",
            });
        }

        let start_url = format!(
            "{}/models/{}:predictLongRunning",
            self.genai_api_base, VIDEO_MODEL
        );
        let response = self
            .client
            .post(&start_url)
            .query(&[("key", api_key.as_str())])
            .json(&json!({
                "instances": [instance],
                "parameters": {"aspectRatio": "9:16", "sampleCount": 1},
            }))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(JobError::quota("video API rate limit reached"));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("video API error {}: {}", status, text);
            if Self::is_quota_error(&message) {
                return Err(JobError::quota(message));
            }
            return Err(JobError::transient(message));
        }

        let body: Value = response.json().await?;
        let operation = body
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| JobError::validation("video API returned no operation name"))?
            .to_string();

        let deadline = tokio::time::Instant::now() + VIDEO_POLL_BUDGET;
        let operation_url = format!("{}/{}", self.genai_api_base, operation);

        loop {
            tokio::time::sleep(self.poll_interval).await;

            let response = self
                .client
                .get(&operation_url)
                .query(&[("key", api_key.as_str())])
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(JobError::transient(format!(
                    "video poll failed: {}",
                    response.status()
                )));
            }
            let body: Value = response.json().await?;

            if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
                return Err(JobError::validation(format!("video generation failed: {}", error)));
            }

            if body.get("done").and_then(|v| v.as_bool()).unwrap_or(false) {
                let uri = body
                    .pointer("/response/generateVideoResponse/generatedSamples/0/video/uri")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| JobError::validation("video operation finished without artifact"))?;
                return self.download(uri).await;
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(JobError::transient("video generation timed out"));
            }
        }
    }

    /// Generates `count` videos and uploads the bytes as-is; the platform
    /// handles 9:16 display.
    pub async fn generate_videos(
        &self,
        store: &SupabaseService,
        bucket: &str,
        product_title: &str,
        product_image_url: Option<&str>,
        count: u32,
        custom_prompt: Option<&str>,
    ) -> CreativeGenerationResult {
        if self.google_api_key.is_none() {
            return CreativeGenerationResult::from_errors(
                vec!["video API key not configured".to_string()],
                Vec::new(),
            );
        }

        let reference = match product_image_url {
            Some(url) => match self.download(url).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    log::warn!(target: "ai_creative", "reference frame unavailable: {}", e);
                    None
                }
            },
            None => None,
        };

        let mut creatives = Vec::new();
        let mut errors = Vec::new();

        for index in 0..count as usize {
            let prompt = Self::video_prompt(product_title, custom_prompt, index);

            let video_bytes = match self.call_video_api(&prompt, reference.as_deref()).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind == crate::contracts::JobErrorKind::QuotaExceeded => {
                    return CreativeGenerationResult {
                        creatives,
                        api_limit_reached: true,
                        error_message: Some(e.message),
                    };
                }
                Err(e) => {
                    errors.push(format!("video {}: {}", index + 1, e.message));
                    continue;
                }
            };

            let path = Self::creative_path("winner-videos", "mp4");
            match store
                .upload_to_storage(bucket, &path, video_bytes, "video/mp4")
                .await
            {
                Ok(url) => {
                    log::info!(target: "ai_creative", "generated video {}/{}", index + 1, count);
                    creatives.push(GeneratedCreative {
                        url,
                        creative_type: CreativeType::Video,
                        model: VIDEO_MODEL.to_string(),
                        prompt_used: Some(prompt.chars().take(500).collect()),
                        pin_id: None,
                    });
                }
                Err(e) => errors.push(format!("video {}: upload failed: {}", index + 1, e.message)),
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        CreativeGenerationResult::from_errors(errors, creatives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::matchers::*;
    use httptest::responders::*;
    use httptest::{Expectation, Server};
    use image::{DynamicImage, RgbImage};

    fn config_for(server: &Server) -> JobConfig {
        let base = server.url_str("").trim_end_matches('/').to_string();
        JobConfig {
            supabase_url: base.clone(),
            supabase_service_key: "key".to_string(),
            pinterest_app_id: None,
            pinterest_app_secret: None,
            openai_api_key: Some("openai-key".to_string()),
            google_api_key: Some("google-key".to_string()),
            creative_bucket: "winner-creatives".to_string(),
            pinterest_api_base: base.clone(),
            openai_api_base: format!("{}/openai", base),
            genai_api_base: format!("{}/genai", base),
            run_budget: Duration::from_secs(1800),
            settle_delay: Duration::from_secs(0),
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 30, image::Rgb([9, 9, 9])));
        let mut buffer = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buffer, image::ImageOutputFormat::Png).unwrap();
        buffer.into_inner()
    }

    #[tokio::test]
    async fn test_image_generation_without_reference_uploads_normalized_png() {
        let server = Server::run();
        let config = config_for(&server);
        let b64 = general_purpose::STANDARD.encode(png_bytes());

        server.expect(
            Expectation::matching(request::method_path("POST", "/openai/images/generations"))
                .times(2)
                .respond_with(json_encoded(serde_json::json!({
                    "data": [{"b64_json": b64}]
                }))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method("POST"),
                request::path(matches("^/storage/v1/object/winner-creatives/winner-images/.*\\.png$")),
            ])
            .times(2)
            .respond_with(json_encoded(serde_json::json!({"Key": "ok"}))),
        );

        let store = SupabaseService::new(&config).unwrap();
        let service = AiCreativeService::new(&config).unwrap();
        let result = service
            .generate_images(&store, "winner-creatives", "Blue Hoodie", None, 2, None)
            .await;

        assert!(!result.api_limit_reached);
        assert_eq!(result.creatives.len(), 2);
        assert!(result.creatives[0].url.contains("/object/public/winner-creatives/"));
        assert_eq!(result.creatives[0].model, IMAGE_MODEL);
    }

    #[tokio::test]
    async fn test_image_rate_limit_stops_the_modality() {
        let server = Server::run();
        let config = config_for(&server);
        server.expect(
            Expectation::matching(request::method_path("POST", "/openai/images/generations"))
                .respond_with(status_code(429)),
        );

        let store = SupabaseService::new(&config).unwrap();
        let service = AiCreativeService::new(&config).unwrap();
        let result = service
            .generate_images(&store, "winner-creatives", "Blue Hoodie", None, 4, None)
            .await;

        assert!(result.api_limit_reached);
        assert!(result.creatives.is_empty());
    }

    #[tokio::test]
    async fn test_reference_image_routes_to_edit_endpoint() {
        let server = Server::run();
        let config = config_for(&server);
        let b64 = general_purpose::STANDARD.encode(png_bytes());

        server.expect(
            Expectation::matching(request::method_path("GET", "/product.jpg"))
                .respond_with(status_code(200).body(png_bytes())),
        );
        server.expect(
            Expectation::matching(request::method_path("POST", "/openai/images/edits"))
                .respond_with(json_encoded(serde_json::json!({"data": [{"b64_json": b64}]}))),
        );
        server.expect(
            Expectation::matching(request::path(matches("^/storage/.*")))
                .respond_with(json_encoded(serde_json::json!({"Key": "ok"}))),
        );

        let store = SupabaseService::new(&config).unwrap();
        let service = AiCreativeService::new(&config).unwrap();
        let reference_url = server.url_str("/product.jpg");
        let result = service
            .generate_images(&store, "winner-creatives", "Hoodie", Some(&reference_url), 1, None)
            .await;

        assert_eq!(result.creatives.len(), 1);
    }

    #[tokio::test]
    async fn test_video_generation_polls_operation_and_uploads_bytes_as_is() {
        let server = Server::run();
        let config = config_for(&server);

        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/genai/models/veo-3.1-generate-preview:predictLongRunning",
            ))
            .respond_with(json_encoded(serde_json::json!({"name": "operations/op-1"}))),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/genai/operations/op-1"))
                .times(2)
                .respond_with(cycle![
                    json_encoded(serde_json::json!({"done": false})),
                    json_encoded(serde_json::json!({
                        "done": true,
                        "response": {"generateVideoResponse": {"generatedSamples": [
                            {"video": {"uri": server.url_str("/artifact.mp4")}}
                        ]}}
                    })),
                ]),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/artifact.mp4"))
                .respond_with(status_code(200).body(vec![7u8; 64])),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method("POST"),
                request::path(matches("^/storage/v1/object/winner-creatives/winner-videos/.*\\.mp4$")),
            ])
            .respond_with(json_encoded(serde_json::json!({"Key": "ok"}))),
        );

        let store = SupabaseService::new(&config).unwrap();
        let service = AiCreativeService::new(&config)
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));
        let result = service
            .generate_videos(&store, "winner-creatives", "Hoodie", None, 1, None)
            .await;

        assert_eq!(result.creatives.len(), 1);
        assert_eq!(result.creatives[0].model, VIDEO_MODEL);
        assert!(!result.api_limit_reached);
    }

    #[tokio::test]
    async fn test_video_quota_error_reports_limit() {
        let server = Server::run();
        let config = config_for(&server);
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/genai/models/veo-3.1-generate-preview:predictLongRunning",
            ))
            .respond_with(status_code(429)),
        );

        let store = SupabaseService::new(&config).unwrap();
        let service = AiCreativeService::new(&config).unwrap();
        let result = service
            .generate_videos(&store, "winner-creatives", "Hoodie", None, 2, None)
            .await;

        assert!(result.api_limit_reached);
    }
}
