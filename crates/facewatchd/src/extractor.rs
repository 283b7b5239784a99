//! Subprocess binding for the external face detector/embedder.
//!
//! The configured program runs for the daemon's lifetime. For each frame the
//! daemon writes one JSON header line, `{"width":W,"height":H}`, followed by
//! exactly `W*H*3` bytes of RGB8 pixels. The program answers with one JSON
//! line: `[{"box":[top,right,bottom,left],"embedding":[...]}, ...]`.

use facewatch_core::{Embedding, FaceBox, FaceExtractor, PipelineError, RawFace};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

#[derive(Serialize)]
struct FrameHeader {
    width: u32,
    height: u32,
}

#[derive(Deserialize)]
struct WireFace {
    #[serde(rename = "box")]
    face_box: [f32; 4],
    embedding: Vec<f32>,
}

pub struct CommandExtractor {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    line: String,
}

impl CommandExtractor {
    /// Spawn `argv[0]` with the remaining arguments.
    pub fn spawn(argv: &[String]) -> Result<Self, PipelineError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| PipelineError::Extraction("no extractor command configured".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PipelineError::Extraction(format!("spawning {program}: {e}")))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(PipelineError::Extraction("extractor pipes unavailable".into()));
        };

        tracing::info!(program = %program, pid = child.id(), "extractor started");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            line: String::new(),
        })
    }

    fn send_frame(&mut self, image: &RgbImage) -> std::io::Result<()> {
        let header = FrameHeader {
            width: image.width(),
            height: image.height(),
        };
        serde_json::to_writer(&mut self.stdin, &header)?;
        self.stdin.write_all(b"\n")?;
        self.stdin.write_all(image.as_raw())?;
        self.stdin.flush()
    }
}

impl FaceExtractor for CommandExtractor {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<RawFace>, PipelineError> {
        self.send_frame(image)
            .map_err(|e| PipelineError::Extraction(format!("writing frame: {e}")))?;

        self.line.clear();
        let n = self
            .stdout
            .read_line(&mut self.line)
            .map_err(|e| PipelineError::Extraction(format!("reading reply: {e}")))?;
        if n == 0 {
            return Err(PipelineError::Extraction("extractor closed its output".into()));
        }
        parse_reply(&self.line)
    }
}

impl Drop for CommandExtractor {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Decode one reply line into extractor output.
fn parse_reply(line: &str) -> Result<Vec<RawFace>, PipelineError> {
    let faces: Vec<WireFace> = serde_json::from_str(line.trim())
        .map_err(|e| PipelineError::Extraction(format!("malformed reply: {e}")))?;

    Ok(faces
        .into_iter()
        .map(|f| {
            let [top, right, bottom, left] = f.face_box;
            RawFace {
                face_box: FaceBox::new(top, right, bottom, left),
                embedding: Embedding::new(f.embedding),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply() {
        let faces =
            parse_reply(r#"[{"box":[10,50,40,5],"embedding":[0.5,-0.25]}]"#).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].face_box, FaceBox::new(10.0, 50.0, 40.0, 5.0));
        assert_eq!(faces[0].embedding.values, vec![0.5, -0.25]);
    }

    #[test]
    fn test_parse_empty_reply() {
        assert!(parse_reply("[]\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_malformed_reply() {
        assert!(matches!(
            parse_reply(r#"{"faces":[]}"#),
            Err(PipelineError::Extraction(_))
        ));
    }

    #[test]
    fn test_spawn_requires_command() {
        assert!(CommandExtractor::spawn(&[]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_roundtrip_with_shell_extractor() {
        // Reads the header, swallows the 2x2 RGB payload, answers with one face.
        let script = r#"while IFS= read -r header; do head -c 12 >/dev/null; echo '[{"box":[1,4,3,2],"embedding":[0.5,0.25]}]'; done"#;
        let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        let mut extractor = CommandExtractor::spawn(&argv).unwrap();

        let image = RgbImage::new(2, 2);
        for _ in 0..2 {
            let faces = extractor.detect_and_embed(&image).unwrap();
            assert_eq!(faces.len(), 1);
            assert_eq!(faces[0].face_box, FaceBox::new(1.0, 4.0, 3.0, 2.0));
        }
    }
}
