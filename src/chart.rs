//! Chart model and gnuplot rendering.
//!
//! A [`Chart`] is a title, axis labels and a list of layers. It renders to a
//! self-contained gnuplot script (data inlined as `$name << EOD` blocks) which
//! `gnuplot` turns into an SVG next to it.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XAxis {
    /// X values are seconds since the Unix epoch, shown as H:M:S.
    WallClock,
    /// X values are plain seconds.
    Seconds,
}

/// A horizontal segment from `x_start` to `x_end` at height `y`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub x_start: f64,
    pub x_end: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    Line {
        label: String,
        points: Vec<(f64, f64)>,
        dashed: bool,
    },
    Segments {
        label: String,
        segments: Vec<Segment>,
    },
    Points {
        label: String,
        points: Vec<(f64, f64)>,
    },
    /// Series stacked bottom-up in order; all share `x`.
    StackedArea {
        x: Vec<f64>,
        series: Vec<(String, Vec<f64>)>,
    },
}

impl Layer {
    fn is_empty(&self) -> bool {
        match self {
            Layer::Line { points, .. } | Layer::Points { points, .. } => points.is_empty(),
            Layer::Segments { segments, .. } => segments.is_empty(),
            Layer::StackedArea { x, series } => x.is_empty() || series.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chart {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub x_axis: XAxis,
    pub x_range: Option<(f64, f64)>,
    pub y_min: Option<f64>,
    pub layers: Vec<Layer>,
    /// Shown in place of the plot when no layer has data.
    pub placeholder: Option<String>,
}

impl Chart {
    pub fn new(title: impl Into<String>, x_axis: XAxis) -> Self {
        Self {
            title: title.into(),
            x_label: String::new(),
            y_label: String::new(),
            x_axis,
            x_range: None,
            y_min: None,
            layers: Vec::new(),
            placeholder: None,
        }
    }

    /// A chart that carries only a message (missing or empty input).
    pub fn placeholder(title: impl Into<String>, message: impl Into<String>) -> Self {
        let mut chart = Self::new(title, XAxis::Seconds);
        chart.placeholder = Some(message.into());
        chart
    }

    pub fn has_data(&self) -> bool {
        self.layers.iter().any(|l| !l.is_empty())
    }

    /// Render the gnuplot script that writes an SVG to `output`.
    pub fn gnuplot_script(&self, output: &Path) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "set terminal svg size 1200,700 dynamic noenhanced");
        let _ = writeln!(s, "set output {}", quote(&output.display().to_string()));
        let _ = writeln!(s, "set title {}", quote(&self.title));
        let _ = writeln!(s, "set xlabel {}", quote(&self.x_label));
        let _ = writeln!(s, "set ylabel {}", quote(&self.y_label));
        let _ = writeln!(s, "set key top left");
        let _ = writeln!(s, "set grid");
        if self.x_axis == XAxis::WallClock {
            let _ = writeln!(s, "set xdata time");
            let _ = writeln!(s, "set timefmt \"%s\"");
            let _ = writeln!(s, "set format x \"%H:%M:%S\"");
            let _ = writeln!(s, "set xtics rotate by 45 right");
        }
        if let Some((lo, hi)) = self.x_range {
            let _ = writeln!(s, "set xrange [{lo}:{hi}]");
        }
        if let Some(lo) = self.y_min {
            let _ = writeln!(s, "set yrange [{lo}:*]");
        }

        if !self.has_data() {
            let msg = self.placeholder.as_deref().unwrap_or("No data");
            let _ = writeln!(s, "set label 1 {} at graph 0.5, 0.5 center", quote(msg));
            let _ = writeln!(s, "plot NaN notitle");
            return s;
        }

        let mut clauses = Vec::new();
        for (i, layer) in self.layers.iter().filter(|l| !l.is_empty()).enumerate() {
            let block = format!("$d{i}");
            let _ = writeln!(s, "{block} << EOD");
            match layer {
                Layer::Line {
                    label,
                    points,
                    dashed,
                } => {
                    for (x, y) in points {
                        let _ = writeln!(s, "{x} {y}");
                    }
                    let dash = if *dashed { " dt 2 lc rgb \"black\"" } else { "" };
                    clauses.push(format!(
                        "{block} using 1:2 with lines lw 1.5{dash} title {}",
                        quote(label)
                    ));
                }
                Layer::Segments { label, segments } => {
                    for seg in segments {
                        let _ = writeln!(s, "{} {} {}", seg.x_start, seg.y, seg.x_end - seg.x_start);
                    }
                    clauses.push(format!(
                        "{block} using 1:2:3:(0) with vectors nohead lw 2 lc rgb \"red\" title {}",
                        quote(label)
                    ));
                }
                Layer::Points { label, points } => {
                    for (x, y) in points {
                        let _ = writeln!(s, "{x} {y}");
                    }
                    clauses.push(format!(
                        "{block} using 1:2 with points pt 7 lc rgb \"dark-green\" title {}",
                        quote(label)
                    ));
                }
                Layer::StackedArea { x, series } => {
                    let mut base = vec![0.0; x.len()];
                    let mut rows: Vec<String> = x.iter().map(|v| v.to_string()).collect();
                    for (_, values) in series {
                        for (j, row) in rows.iter_mut().enumerate() {
                            let lo = base[j];
                            let hi = lo + values.get(j).copied().unwrap_or(0.0);
                            let _ = write!(row, " {lo} {hi}");
                            base[j] = hi;
                        }
                    }
                    for row in rows {
                        let _ = writeln!(s, "{row}");
                    }
                    for (k, (label, _)) in series.iter().enumerate() {
                        let lo = 2 + 2 * k;
                        clauses.push(format!(
                            "{block} using 1:{lo}:{} with filledcurves fs transparent solid 0.7 title {}",
                            lo + 1,
                            quote(label)
                        ));
                    }
                }
            }
            let _ = writeln!(s, "EOD");
        }
        let _ = writeln!(s, "plot {}", clauses.join(", \\\n     "));
        s
    }
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

/// What `render` managed to produce.
#[derive(Debug, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Script written and rendered to the image.
    Rendered(PathBuf),
    /// Script written; gnuplot is not installed.
    ScriptOnly(PathBuf),
}

#[derive(Debug)]
pub enum ChartError {
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Spawn { source: std::io::Error },
    Gnuplot { status: Option<i32>, stderr: String },
}

impl std::fmt::Display for ChartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChartError::Write { path, source } => {
                write!(f, "failed to write chart script {}: {}", path.display(), source)
            }
            ChartError::Spawn { source } => write!(f, "failed to run gnuplot: {source}"),
            ChartError::Gnuplot { status, stderr } => {
                write!(f, "gnuplot exited with {status:?}: {}", stderr.trim())
            }
        }
    }
}

impl std::error::Error for ChartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChartError::Write { source, .. } => Some(source),
            ChartError::Spawn { source } => Some(source),
            ChartError::Gnuplot { .. } => None,
        }
    }
}

/// Write the chart's script to `script_path` and run gnuplot on it.
pub fn render(chart: &Chart, script_path: &Path, image_path: &Path) -> Result<RenderOutcome, ChartError> {
    let script = chart.gnuplot_script(image_path);
    std::fs::write(script_path, script).map_err(|e| ChartError::Write {
        path: script_path.to_path_buf(),
        source: e,
    })?;

    let output = match Command::new("gnuplot").arg(script_path).output() {
        Ok(o) => o,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(
                script = %script_path.display(),
                "gnuplot not found, chart script left for manual rendering"
            );
            return Ok(RenderOutcome::ScriptOnly(script_path.to_path_buf()));
        }
        Err(e) => return Err(ChartError::Spawn { source: e }),
    };
    if !output.status.success() {
        return Err(ChartError::Gnuplot {
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    tracing::info!(image = %image_path.display(), "chart rendered");
    Ok(RenderOutcome::Rendered(image_path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chart() -> Chart {
        let mut chart = Chart::new("Workload \"A\"", XAxis::WallClock);
        chart.x_label = "Time (H:M:S)".to_string();
        chart.y_label = "MB/s".to_string();
        chart.layers.push(Layer::Line {
            label: "client1".to_string(),
            points: vec![(10.0, 1.5), (12.0, 2.5)],
            dashed: false,
        });
        chart.layers.push(Layer::Segments {
            label: "Compaction".to_string(),
            segments: vec![Segment {
                x_start: 10.5,
                x_end: 11.0,
                y: 2.0,
            }],
        });
        chart.layers.push(Layer::Points {
            label: "Stall Started".to_string(),
            points: vec![],
        });
        chart
    }

    #[test]
    fn test_script_contains_layers_and_axis() {
        let script = sample_chart().gnuplot_script(Path::new("/tmp/out.svg"));
        assert!(script.contains("set output \"/tmp/out.svg\""));
        assert!(script.contains("set title \"Workload \\\"A\\\"\""));
        assert!(script.contains("set xdata time"));
        assert!(script.contains("$d0 << EOD\n10 1.5\n12 2.5\nEOD"));
        assert!(script.contains("$d1 << EOD\n10.5 2 0.5\nEOD"));
        assert!(script.contains("with vectors nohead"));
        // Empty stall layer is left out entirely.
        assert!(!script.contains("$d2"));
        assert!(!script.contains("Stall Started"));
    }

    #[test]
    fn test_stacked_area_accumulates() {
        let mut chart = Chart::new("Flush queue", XAxis::Seconds);
        chart.layers.push(Layer::StackedArea {
            x: vec![0.0, 1.0],
            series: vec![
                ("kManualFlush".to_string(), vec![1.0, 0.0]),
                ("kWriteBufferFull".to_string(), vec![2.0, 3.0]),
            ],
        });
        chart.x_range = Some((0.0, 60.0));
        chart.y_min = Some(0.0);
        let script = chart.gnuplot_script(Path::new("fq.svg"));
        assert!(script.contains("0 0 1 1 3\n1 0 0 0 3\n"));
        assert!(script.contains("using 1:2:3 with filledcurves"));
        assert!(script.contains("using 1:4:5 with filledcurves"));
        assert!(script.contains("set xrange [0:60]"));
        assert!(script.contains("set yrange [0:*]"));
        assert!(!script.contains("xdata time"));
    }

    #[test]
    fn test_placeholder_when_no_data() {
        let chart = Chart::placeholder("Flush Queue State (Error)", "WAL_logs.csv not found");
        assert!(!chart.has_data());
        let script = chart.gnuplot_script(Path::new("fq.svg"));
        assert!(script.contains("set label 1 \"WAL_logs.csv not found\""));
        assert!(script.contains("plot NaN notitle"));
    }

    #[test]
    fn test_render_writes_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("chart.gp");
        let image = dir.path().join("chart.svg");
        // Rendering depends on gnuplot being installed; the script is written either way.
        let _ = render(&sample_chart(), &script, &image);
        let text = std::fs::read_to_string(&script).unwrap();
        assert!(text.starts_with("set terminal svg"));
    }

    #[test]
    fn test_render_bad_script_path() {
        let err = render(
            &sample_chart(),
            Path::new("/nonexistent-dir/x/chart.gp"),
            Path::new("/tmp/chart.svg"),
        )
        .unwrap_err();
        assert!(matches!(err, ChartError::Write { .. }));
    }
}
