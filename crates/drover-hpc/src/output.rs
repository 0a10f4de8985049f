//! Parsers for scheduler output.
//!
//! Turns submission acknowledgements, status listings, accounting tables and
//! rendered report files into normalized values. Parse failures carry the
//! raw text for diagnosis.

use crate::error::{HpcError, HpcResult};

/// Banner line LSF prints immediately before the user output in its report.
const LSF_OUTPUT_BEGIN: &str = "The output (if any) follows:";

/// Marker prefix of the trailer section that ends the user output.
const LSF_OUTPUT_END: &str = "PS:";

/// Parse a bsub acknowledgement to extract the job id.
///
/// bsub prints `Job <12345> is submitted to queue <normal>.`
pub fn parse_lsf_job_id(output: &str) -> HpcResult<u64> {
    let err = || HpcError::Acknowledgement {
        command: "bsub".to_string(),
        output: output.to_string(),
    };

    let start = output.find("Job <").ok_or_else(err)?;
    let rest = &output[start + "Job <".len()..];
    let end = rest.find('>').ok_or_else(err)?;
    rest[..end].parse().map_err(|_| err())
}

/// Parse an sbatch acknowledgement to extract the job id.
///
/// sbatch prints `Submitted batch job 12345`.
pub fn parse_slurm_job_id(output: &str) -> HpcResult<u64> {
    output
        .trim()
        .strip_prefix("Submitted batch job ")
        .and_then(|rest| rest.trim().parse().ok())
        .ok_or_else(|| HpcError::Acknowledgement {
            command: "sbatch".to_string(),
            output: output.to_string(),
        })
}

/// Parse a qsub acknowledgement: Cobalt prints the bare job id.
pub fn parse_cobalt_job_id(output: &str) -> HpcResult<u64> {
    output
        .trim()
        .parse()
        .map_err(|_| HpcError::Acknowledgement {
            command: "qsub".to_string(),
            output: output.to_string(),
        })
}

/// Extract the user output from a rendered LSF report file: the text
/// strictly between the output banner and the `PS:` trailer.
///
/// `path` is only used for error context.
pub fn extract_lsf_report(text: &str, path: &std::path::Path) -> HpcResult<String> {
    let lines: Vec<&str> = text.lines().collect();

    let begin = lines
        .iter()
        .position(|line| line.contains(LSF_OUTPUT_BEGIN))
        .ok_or_else(|| marker_err(path, "output banner not found"))?;
    let end = lines[begin..]
        .iter()
        .position(|line| line.trim_start().starts_with(LSF_OUTPUT_END))
        .map(|offset| begin + offset)
        .ok_or_else(|| marker_err(path, "output trailer not found"))?;

    let mut body: &[&str] = &lines[begin + 1..end];
    while body.first().is_some_and(|line| line.trim().is_empty()) {
        body = &body[1..];
    }
    while body.last().is_some_and(|line| line.trim().is_empty()) {
        body = &body[..body.len() - 1];
    }

    Ok(body.join("\n"))
}

fn marker_err(path: &std::path::Path, message: &str) -> HpcError {
    HpcError::OutputRetrieval {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// Terminal accounting record for a job.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AccountingRecord {
    /// Terminal scheduler state, e.g. `COMPLETED` or `FAILED`.
    pub state: String,
    /// Exit code of the job step.
    pub exit_code: i32,
}

/// Parse `sacct -p -j <id> --format=state,exitcode` parseable output.
///
/// The header names the columns; sub-steps like `12345.batch` are skipped
/// when a JobID column is present. The exit code uses the `code:signal`
/// form; only the code half is kept.
pub fn parse_sacct(output: &str) -> HpcResult<AccountingRecord> {
    let err = |message: &str| HpcError::Monitoring {
        command: "sacct".to_string(),
        message: format!("{message}: {output:?}"),
    };

    let mut lines = output.lines();
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| err("empty accounting output"))?
        .split('|')
        .map(str::trim)
        .collect();

    let col = |name: &str| {
        header
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
    };
    let state_col = col("State").ok_or_else(|| err("no State column"))?;
    let exit_col = col("ExitCode").ok_or_else(|| err("no ExitCode column"))?;
    let jobid_col = col("JobID");

    for line in lines {
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        if fields.len() <= state_col.max(exit_col) {
            continue;
        }
        if let Some(id_col) = jobid_col {
            // Skip sub-steps like "12345.batch" / "12345.extern".
            if fields.get(id_col).is_none_or(|id| id.contains('.') || id.is_empty()) {
                continue;
            }
        }

        let state = fields[state_col].to_string();
        let exit_code = fields[exit_col]
            .split(':')
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| err("unparseable exit code"))?;

        return Ok(AccountingRecord { state, exit_code });
    }

    Err(err("no accounting record for job"))
}

/// Whether a squeue listing still shows the given job id.
///
/// Matches on the first whitespace-separated token of each data line, so a
/// short id never matches inside a longer one.
pub fn squeue_lists_job(output: &str, job_id: u64) -> bool {
    let id = job_id.to_string();
    output
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .any(|token| token == id)
}

/// Assemble the combined Cobalt report: debug log followed by labeled
/// stdout and stderr sections.
pub fn labeled_report(debug_log: &str, stdout: &str, stderr: &str) -> String {
    let mut report = String::with_capacity(debug_log.len() + stdout.len() + stderr.len() + 32);
    report.push_str(debug_log);
    report.push_str("\nJob stdout:\n");
    report.push_str(stdout);
    report.push_str("\nJob stderr:\n");
    report.push_str(stderr);
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsf_job_id() {
        let output = "Job <1337> is submitted to queue <normal>.\n";
        assert_eq!(parse_lsf_job_id(output).unwrap(), 1337);
    }

    #[test]
    fn test_parse_lsf_job_id_error_keeps_text() {
        let err = parse_lsf_job_id("Request aborted by esub.\n").unwrap_err();
        match err {
            HpcError::Acknowledgement { output, .. } => {
                assert!(output.contains("esub"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_slurm_job_id() {
        assert_eq!(
            parse_slurm_job_id("Submitted batch job 4821\n").unwrap(),
            4821
        );
        assert!(parse_slurm_job_id("sbatch: error: invalid partition\n").is_err());
    }

    #[test]
    fn test_parse_cobalt_job_id() {
        assert_eq!(parse_cobalt_job_id("90210\n").unwrap(), 90210);
        assert!(parse_cobalt_job_id("qsub: project required\n").is_err());
    }

    #[test]
    fn test_extract_lsf_report() {
        let text = "Sender: LSF System <lsfadmin@host>\n\
                    Job <1337> was submitted.\n\
                    \n\
                    The output (if any) follows:\n\
                    \n\
                    hello from the job\n\
                    second line\n\
                    \n\
                    PS:\n\
                    Read file <err.log> for stderr output.\n";
        let report = std::path::Path::new("lsf_out.log");
        let body = extract_lsf_report(text, report).unwrap();
        assert_eq!(body, "hello from the job\nsecond line");
    }

    #[test]
    fn test_extract_lsf_report_missing_markers() {
        let report = std::path::Path::new("lsf_out.log");
        assert!(extract_lsf_report("no banners here", report).is_err());
        assert!(
            extract_lsf_report("The output (if any) follows:\nbody, no trailer", report).is_err()
        );
    }

    #[test]
    fn test_parse_sacct() {
        let output = "JobID|State|ExitCode\n4821|COMPLETED|0:0\n4821.batch|COMPLETED|0:0\n";
        let record = parse_sacct(output).unwrap();
        assert_eq!(record.state, "COMPLETED");
        assert_eq!(record.exit_code, 0);
    }

    #[test]
    fn test_parse_sacct_failed_job() {
        let output = "State|ExitCode\nFAILED|2:0\n";
        let record = parse_sacct(output).unwrap();
        assert_eq!(record.state, "FAILED");
        assert_eq!(record.exit_code, 2);
    }

    #[test]
    fn test_parse_sacct_no_record() {
        assert!(parse_sacct("JobID|State|ExitCode\n").is_err());
        assert!(parse_sacct("JobID|State|ExitCode\n4821.batch|COMPLETED|0:0\n").is_err());
    }

    #[test]
    fn test_squeue_lists_job() {
        let output = "JOBID PARTITION NAME USER ST TIME NODES\n\
                      4821 compute batch alice R 0:42 1\n";
        assert!(squeue_lists_job(output, 4821));
        assert!(!squeue_lists_job(output, 48));

        let drained = "JOBID PARTITION NAME USER ST TIME NODES\n";
        assert!(!squeue_lists_job(drained, 4821));
    }

    #[test]
    fn test_labeled_report() {
        let report = labeled_report("debug text", "out text", "err text");
        assert_eq!(report, "debug text\nJob stdout:\nout text\nJob stderr:\nerr text");
    }
}
