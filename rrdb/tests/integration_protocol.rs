//! End-to-end tests of the text protocol over the engine.
//!
//! These drive [`Engine::handle_tcp`] and [`Engine::handle_udp`] with the
//! same statements a network client would send, including a restart of the
//! engine on the same data directory.

use rrdb::{Duration, Engine, RegistryOptions};
use tempfile::tempdir;

/// Aligned to 30 seconds so the coarsest tier's bucket starts at `TS0`.
const TS0: u64 = 1_700_000_010;

const TEST1_POLICY: &str = "1 sec for 10 secs, 10 secs for 30 secs, 30 secs for 10 mins";
const TEST2_POLICY: &str = "10 secs for 1 week, 1 min for 1 month, 10 mins for 1 year, 30 mins for 10 years";

fn year_start(ts: u64) -> u64 {
    let year = Duration::parse("1 year").unwrap().to_seconds();
    ts - ts % year
}

fn data_rows(response: &str) -> Vec<Vec<String>> {
    response
        .lines()
        .skip(1)
        .map(|line| line.split(',').map(str::to_string).collect())
        .collect()
}

#[test]
fn test_create_update_select_group_by_year() {
    let temp_dir = tempdir().unwrap();
    let engine = Engine::open(temp_dir.path(), RegistryOptions::default()).unwrap();

    assert_eq!(
        engine.handle_tcp(
            "CREATE METRIC 'test1' KEEP '1 sec for 10 sec, 10 secs for 30 secs, 30 secs for 10 min';"
        ),
        "OK"
    );
    assert_eq!(engine.handle_tcp("SHOW METRIC POLICY 'test1';"), TEST1_POLICY);

    for i in 0..30 {
        let statement = format!("UPDATE METRIC 'test1' ADD 1.0 AT {};", TS0 + i);
        assert_eq!(engine.handle_tcp(&statement), "OK");
    }

    let response = engine.handle_tcp(&format!(
        "SELECT * FROM METRIC 'test1' BETWEEN {TS0} AND {} GROUP BY 1 year;",
        TS0 + 31
    ));
    assert_eq!(
        response,
        format!(
            "ts,count,sum,avg,stddev,min,max\n{},30,30,1,0,1,1\n",
            year_start(TS0)
        )
    );
}

#[test]
fn test_tier_selection_by_group_by() {
    let temp_dir = tempdir().unwrap();
    let engine = Engine::open(temp_dir.path(), RegistryOptions::default()).unwrap();
    engine.handle_tcp(&format!("CREATE 'test1' KEEP {TEST1_POLICY};"));

    for i in 0..30 {
        engine.handle_tcp(&format!("UPDATE 'test1' ADD 1 AT {};", TS0 + i));
    }
    let select = |group_by: &str| {
        engine.handle_tcp(&format!(
            "SELECT * FROM 'test1' BETWEEN {TS0} AND {} {group_by};",
            TS0 + 31
        ))
    };

    // Native buckets of the finest tier: only the last 10 seconds survive.
    let native = select("GROUP BY 0 secs");
    assert!(native.starts_with("ts,count,sum,sum_sqr,min,max\n"));
    let rows = data_rows(&native);
    assert_eq!(rows.len(), 10);
    assert_eq!(rows[0][0], (TS0 + 20).to_string());
    assert_eq!(rows[9][0], (TS0 + 29).to_string());
    assert_eq!(native, select(""));

    // 10 second buckets come straight from the second tier.
    let rows = data_rows(&select("GROUP BY 10 secs"));
    let summary: Vec<(&str, &str)> = rows.iter().map(|r| (r[0].as_str(), r[1].as_str())).collect();
    let expected: Vec<String> = (0..3).map(|i| (TS0 + i * 10).to_string()).collect();
    assert_eq!(
        summary,
        vec![
            (expected[0].as_str(), "10"),
            (expected[1].as_str(), "10"),
            (expected[2].as_str(), "10"),
        ]
    );

    // 5 second groups are merged from the finest tier.
    let merged = select("GROUP BY 5 secs");
    assert!(merged.starts_with("ts,count,sum,avg,stddev,min,max\n"));
    let rows = data_rows(&merged);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][1], "5");
    assert_eq!(rows[1][1], "5");
}

#[test]
fn test_restart_keeps_metrics_and_data() {
    let temp_dir = tempdir().unwrap();

    {
        let engine = Engine::open(temp_dir.path(), RegistryOptions::default()).unwrap();
        assert_eq!(engine.handle_tcp(&format!("CREATE 'test1' KEEP '{TEST1_POLICY}';")), "OK");
        assert_eq!(engine.handle_tcp(&format!("CREATE 'test2' KEEP '{TEST2_POLICY}';")), "OK");
        for i in 0..30 {
            engine.handle_tcp(&format!("UPDATE 'test1' ADD 1 AT {};", TS0 + i));
        }
        engine.flush().unwrap();
    }

    let engine = Engine::open(temp_dir.path(), RegistryOptions::default()).unwrap();
    assert_eq!(engine.handle_tcp("SHOW METRICS LIKE 'test';"), "test1;test2;");
    assert_eq!(engine.handle_tcp("SHOW METRIC POLICY 'test1';"), TEST1_POLICY);
    assert_eq!(engine.handle_tcp("SHOW METRIC POLICY 'test2';"), TEST2_POLICY);

    for i in 0..30 {
        engine.handle_tcp(&format!("UPDATE 'test1' ADD 1 AT {};", TS0 + 30 + i));
    }

    let response = engine.handle_tcp(&format!(
        "SELECT * FROM 'test1' BETWEEN {TS0} AND {} GROUP BY 1 year;",
        TS0 + 61
    ));
    assert_eq!(
        response,
        format!(
            "ts,count,sum,avg,stddev,min,max\n{},60,60,1,0,1,1\n",
            year_start(TS0)
        )
    );

    // test2 was never updated.
    assert_eq!(
        engine.handle_tcp(&format!("SELECT * FROM 'test2' BETWEEN {TS0} AND {};", TS0 + 61)),
        "ts,count,sum,sum_sqr,min,max\n"
    );

    assert_eq!(
        engine.handle_tcp(&format!("SELECT * FROM 'xxx' BETWEEN {TS0} AND {};", TS0 + 61)),
        "ERROR: The metric 'xxx' does not exist"
    );

    assert_eq!(engine.handle_tcp("DROP METRIC 'test1';"), "OK");
    assert_eq!(engine.handle_tcp("DROP METRIC 'test2';"), "OK");
    assert_eq!(engine.handle_tcp("SHOW METRICS;"), "");
}

#[test]
fn test_udp_and_tcp_share_metrics() {
    let temp_dir = tempdir().unwrap();
    let engine = Engine::open(temp_dir.path(), RegistryOptions::default()).unwrap();

    engine.handle_udp("c|requests|1 min for 1 hour").unwrap();
    for i in 0..4 {
        engine.handle_udp(&format!("u|requests|{i}|{}", 1_800 + i)).unwrap();
    }
    // Dropped without a reply.
    assert!(engine.handle_udp("u|requests|NaN|1800").is_err());
    assert!(engine.handle_udp("bogus").is_err());

    assert_eq!(
        engine.handle_tcp("SELECT * FROM 'requests' BETWEEN 1800 AND 1860;"),
        "ts,count,sum,sum_sqr,min,max\n1800,4,6,14,0,3\n"
    );
    assert_eq!(
        engine.handle_tcp("SHOW METRIC 'requests';"),
        "name,last_ts,last_value\nrequests,1803,3\n"
    );
}

#[test]
fn test_invalid_input_errors() {
    let temp_dir = tempdir().unwrap();
    let engine = Engine::open(temp_dir.path(), RegistryOptions::default()).unwrap();

    assert_eq!(
        engine.handle_tcp("CREATE 'bad' KEEP '10 secs for 1 min, 1 sec for 1 hour';"),
        format!(
            "ERROR: {}",
            rrdb::RetentionPolicy::parse("10 secs for 1 min, 1 sec for 1 hour").unwrap_err()
        )
    );
    assert_eq!(
        engine.handle_tcp("SELECT * FROM 'bad' BETWEEN 1 AND 2 GROUP BY 3 eons;"),
        "ERROR: Unable to parse the interval '3 eons'"
    );
    assert_eq!(engine.handle_tcp("UPDATE 'x' ADD 1"), "ERROR: Unable to parse the statement");
    assert!(engine.handle_tcp("UPDATE 'no spaces allowed' ADD 1 AT 5;").starts_with("ERROR: "));
    assert_eq!(engine.handle_tcp("SHOW METRICS;"), "");
}
