use super::ast::Scalar;
use crate::stats;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

// ---------------------------------------------------------------------------
// Function library shared by expression conditions, scripts, and transforms
// ---------------------------------------------------------------------------

/// Dispatch a function call on pre-evaluated arguments. Unknown functions,
/// arity mismatches, and operand type mismatches all yield nil.
pub(crate) fn call(name: &str, args: &[Option<Scalar>]) -> Option<Scalar> {
    // Null-handling functions operate on the raw Option arguments.
    match name {
        "coalesce" => return args.iter().flatten().next().cloned(),
        "isnull" => return Some(Scalar::Bool(args.first()?.is_none())),
        "isnotnull" => return Some(Scalar::Bool(args.first()?.is_some())),
        _ => {}
    }
    // Everything below requires all arguments present.
    let vals: Vec<&Scalar> = args.iter().map(Option::as_ref).collect::<Option<_>>()?;
    dispatch(name, &vals)
}

fn dispatch(name: &str, args: &[&Scalar]) -> Option<Scalar> {
    match name {
        // -- math -----------------------------------------------------------
        "abs" => Some(Scalar::Number(num(args, 0)?.abs())),
        "ceil" => Some(Scalar::Number(num(args, 0)?.ceil())),
        "floor" => Some(Scalar::Number(num(args, 0)?.floor())),
        "trunc" => Some(Scalar::Number(num(args, 0)?.trunc())),
        "sign" => {
            let n = num(args, 0)?;
            n.is_finite().then(|| Scalar::Number(n.signum()))
        }
        "sqrt" => {
            let n = num(args, 0)?;
            (n >= 0.0).then(|| Scalar::Number(n.sqrt()))
        }
        "exp" => finite(num(args, 0)?.exp()),
        "pow" => finite(num(args, 0)?.powf(num(args, 1)?)),
        "log" => {
            let x = num(args, 0)?;
            if x <= 0.0 {
                return None;
            }
            match args.len() {
                1 => finite(x.ln()),
                2 => {
                    let base = num(args, 1)?;
                    if base <= 0.0 || (base - 1.0).abs() < f64::EPSILON {
                        return None;
                    }
                    finite(x.log(base))
                }
                _ => None,
            }
        }
        "round" => {
            let x = num(args, 0)?;
            let digits = if args.len() == 2 { num(args, 1)?.trunc() as i32 } else { 0 };
            round_to(x, digits).map(Scalar::Number)
        }
        "clamp" => {
            let (x, lo, hi) = (num(args, 0)?, num(args, 1)?, num(args, 2)?);
            (lo <= hi).then(|| Scalar::Number(x.clamp(lo, hi)))
        }
        // min/max over two numbers or one numeric array
        "min" => reduce_or_pair(args, |v| v.iter().copied().fold(f64::INFINITY, f64::min)),
        "max" => reduce_or_pair(args, |v| v.iter().copied().fold(f64::NEG_INFINITY, f64::max)),

        // -- strings --------------------------------------------------------
        "contains" => Some(Scalar::Bool(st(args, 0)?.contains(st(args, 1)?))),
        "startswith" => Some(Scalar::Bool(st(args, 0)?.starts_with(st(args, 1)?))),
        "endswith" => Some(Scalar::Bool(st(args, 0)?.ends_with(st(args, 1)?))),
        "lower" => Some(Scalar::Str(st(args, 0)?.to_lowercase())),
        "upper" => Some(Scalar::Str(st(args, 0)?.to_uppercase())),
        "trim" => Some(Scalar::Str(st(args, 0)?.trim().to_string())),
        "len" => match args.first()? {
            Scalar::Str(s) => Some(Scalar::Number(s.len() as f64)),
            Scalar::Array(a) => Some(Scalar::Number(a.len() as f64)),
            _ => None,
        },
        "concat" => {
            let mut out = String::new();
            for arg in args {
                out.push_str(&arg.display_string());
            }
            Some(Scalar::Str(out))
        }
        "regex_match" => {
            let re = regex::Regex::new(st(args, 1)?).ok()?;
            Some(Scalar::Bool(re.is_match(st(args, 0)?)))
        }
        "replace" => {
            let re = regex::Regex::new(st(args, 1)?).ok()?;
            Some(Scalar::Str(
                re.replace_all(st(args, 0)?, st(args, 2)?).into_owned(),
            ))
        }

        // -- geo ------------------------------------------------------------
        "distance" => Some(Scalar::Number(haversine_m(
            num(args, 0)?,
            num(args, 1)?,
            num(args, 2)?,
            num(args, 3)?,
        ))),
        "bearing" => Some(Scalar::Number(bearing_deg(
            num(args, 0)?,
            num(args, 1)?,
            num(args, 2)?,
            num(args, 3)?,
        ))),
        "geofence" => {
            let d = haversine_m(num(args, 0)?, num(args, 1)?, num(args, 2)?, num(args, 3)?);
            Some(Scalar::Bool(d <= num(args, 4)?))
        }

        // -- vectors (numeric arrays) --------------------------------------
        "magnitude" => {
            let v = vec_arg(args, 0)?;
            Some(Scalar::Number(v.iter().map(|x| x * x).sum::<f64>().sqrt()))
        }
        "normalize" => {
            let v = vec_arg(args, 0)?;
            let mag = v.iter().map(|x| x * x).sum::<f64>().sqrt();
            (mag > 0.0).then(|| Scalar::numbers(&v.iter().map(|x| x / mag).collect::<Vec<_>>()))
        }
        "dot" => {
            let (a, b) = (vec_arg(args, 0)?, vec_arg(args, 1)?);
            (a.len() == b.len())
                .then(|| Scalar::Number(a.iter().zip(&b).map(|(x, y)| x * y).sum()))
        }
        "cross" => {
            let (a, b) = (vec_arg(args, 0)?, vec_arg(args, 1)?);
            if a.len() != 3 || b.len() != 3 {
                return None;
            }
            Some(Scalar::numbers(&[
                a[1] * b[2] - a[2] * b[1],
                a[2] * b[0] - a[0] * b[2],
                a[0] * b[1] - a[1] * b[0],
            ]))
        }
        // rotate([x,y,...], degrees) — rotation about the z axis
        "rotate" => {
            let v = vec_arg(args, 0)?;
            if v.len() < 2 {
                return None;
            }
            let rad = num(args, 1)?.to_radians();
            let (sin, cos) = rad.sin_cos();
            let mut out = v.clone();
            out[0] = v[0] * cos - v[1] * sin;
            out[1] = v[0] * sin + v[1] * cos;
            Some(Scalar::numbers(&out))
        }
        // project(a, b) — scalar projection of a onto b
        "project" => {
            let (a, b) = (vec_arg(args, 0)?, vec_arg(args, 1)?);
            if a.len() != b.len() {
                return None;
            }
            let mag_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
            (mag_b > 0.0)
                .then(|| Scalar::Number(a.iter().zip(&b).map(|(x, y)| x * y).sum::<f64>() / mag_b))
        }

        // -- color ----------------------------------------------------------
        "brightness" => {
            let (r, g, b) = (num(args, 0)?, num(args, 1)?, num(args, 2)?);
            Some(Scalar::Number((0.299 * r + 0.587 * g + 0.114 * b) / 255.0))
        }
        // 1.0 = identical, 0.0 = opposite corners of the RGB cube
        "color_similarity" => {
            let dr = num(args, 0)? - num(args, 3)?;
            let dg = num(args, 1)? - num(args, 4)?;
            let db = num(args, 2)? - num(args, 5)?;
            let dist = (dr * dr + dg * dg + db * db).sqrt();
            let max = (3.0f64 * 255.0 * 255.0).sqrt();
            Some(Scalar::Number(1.0 - dist / max))
        }
        "rgb_to_hsv" => {
            let c = color_arg(args)?;
            let (h, s, v) = c.to_hsv();
            Some(Scalar::numbers(&[h, s, v]))
        }
        "rgb_to_hsl" => {
            let c = color_arg(args)?;
            let (h, s, l) = c.to_hsl();
            Some(Scalar::numbers(&[h, s, l]))
        }

        // -- array reducers --------------------------------------------------
        "mean" | "avg" => stats::mean(&vec_arg(args, 0)?).map(Scalar::Number),
        "sum" => Some(Scalar::Number(vec_arg(args, 0)?.iter().sum())),
        "stddev" => stats::stddev(&vec_arg(args, 0)?).map(Scalar::Number),
        "median" => stats::median(&vec_arg(args, 0)?).map(Scalar::Number),
        "percentile" => {
            stats::percentile(&vec_arg(args, 0)?, num(args, 1)?).map(Scalar::Number)
        }
        "p25" => stats::percentile(&vec_arg(args, 0)?, 25.0).map(Scalar::Number),
        "p50" => stats::percentile(&vec_arg(args, 0)?, 50.0).map(Scalar::Number),
        "p75" => stats::percentile(&vec_arg(args, 0)?, 75.0).map(Scalar::Number),
        "p90" => stats::percentile(&vec_arg(args, 0)?, 90.0).map(Scalar::Number),
        "p95" => stats::percentile(&vec_arg(args, 0)?, 95.0).map(Scalar::Number),
        "p99" => stats::percentile(&vec_arg(args, 0)?, 99.0).map(Scalar::Number),

        _ => None, // unsupported function
    }
}

// ---------------------------------------------------------------------------
// argument helpers
// ---------------------------------------------------------------------------

fn num(args: &[&Scalar], i: usize) -> Option<f64> {
    args.get(i)?.as_number()
}

fn st<'a>(args: &[&'a Scalar], i: usize) -> Option<&'a str> {
    args.get(i)?.as_str()
}

fn vec_arg(args: &[&Scalar], i: usize) -> Option<Vec<f64>> {
    args.get(i)?.as_numeric_array()
}

fn color_arg(args: &[&Scalar]) -> Option<crate::reading::Color> {
    let (r, g, b) = (num(args, 0)?, num(args, 1)?, num(args, 2)?);
    if !(0.0..=255.0).contains(&r) || !(0.0..=255.0).contains(&g) || !(0.0..=255.0).contains(&b) {
        return None;
    }
    Some(crate::reading::Color {
        r: r as u8,
        g: g as u8,
        b: b as u8,
    })
}

fn finite(n: f64) -> Option<Scalar> {
    n.is_finite().then_some(Scalar::Number(n))
}

/// `min(a, b)` on two numbers, or `min(arr)` on one numeric array.
fn reduce_or_pair(args: &[&Scalar], reduce: impl Fn(&[f64]) -> f64) -> Option<Scalar> {
    match args {
        [Scalar::Array(_)] => {
            let v = vec_arg(args, 0)?;
            (!v.is_empty()).then(|| Scalar::Number(reduce(&v)))
        }
        [a, b] => {
            let pair = [a.as_number()?, b.as_number()?];
            Some(Scalar::Number(reduce(&pair)))
        }
        _ => None,
    }
}

fn round_to(x: f64, digits: i32) -> Option<f64> {
    if !x.is_finite() {
        return None;
    }
    let factor = 10_f64.powi(digits);
    if !factor.is_finite() || factor == 0.0 {
        return None;
    }
    Some((x * factor).round() / factor)
}

fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

fn bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dlambda = (lon2 - lon1).to_radians();
    let y = dlambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlambda.cos();
    y.atan2(x).to_degrees().rem_euclid(360.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn n(v: f64) -> Option<Scalar> {
        Some(Scalar::Number(v))
    }

    fn call_nums(name: &str, nums: &[f64]) -> Option<Scalar> {
        let args: Vec<Option<Scalar>> = nums.iter().map(|v| n(*v)).collect();
        call(name, &args)
    }

    #[test]
    fn rounding_honours_digits() {
        assert_eq!(call_nums("round", &[77.123, 1.0]), n(77.1));
        assert_eq!(call_nums("round", &[77.5]), n(78.0));
    }

    #[test]
    fn min_max_overloads() {
        assert_eq!(call_nums("min", &[3.0, 7.0]), n(3.0));
        let arr = Some(Scalar::numbers(&[5.0, 2.0, 9.0]));
        assert_eq!(call("max", &[arr]), n(9.0));
    }

    #[test]
    fn coalesce_skips_nil() {
        assert_eq!(call("coalesce", &[None, n(4.0)]), n(4.0));
        assert_eq!(call("isnull", &[None]), Some(Scalar::Bool(true)));
        assert_eq!(call("isnotnull", &[n(1.0)]), Some(Scalar::Bool(true)));
    }

    #[test]
    fn haversine_known_distance() {
        // Amsterdam → Paris is roughly 430 km.
        let d = call_nums("distance", &[52.37, 4.89, 48.86, 2.35]).unwrap();
        let km = d.as_number().unwrap() / 1000.0;
        assert!((425.0..435.0).contains(&km), "got {km} km");
    }

    #[test]
    fn geofence_inside_and_outside() {
        assert_eq!(
            call_nums("geofence", &[52.0, 4.0, 52.0, 4.0, 10.0]),
            Some(Scalar::Bool(true)),
        );
        assert_eq!(
            call_nums("geofence", &[52.0, 4.0, 53.0, 4.0, 10.0]),
            Some(Scalar::Bool(false)),
        );
    }

    #[test]
    fn vector_algebra() {
        let a = Some(Scalar::numbers(&[3.0, 4.0, 0.0]));
        let b = Some(Scalar::numbers(&[1.0, 0.0, 0.0]));
        assert_eq!(call("magnitude", &[a.clone()]), n(5.0));
        assert_eq!(call("dot", &[a.clone(), b.clone()]), n(3.0));
        let cross = call("cross", &[a, b]).unwrap().as_numeric_array().unwrap();
        assert_eq!(cross, vec![0.0, 0.0, -4.0]);
    }

    #[test]
    fn rotate_quarter_turn() {
        let v = Some(Scalar::numbers(&[1.0, 0.0, 5.0]));
        let out = call("rotate", &[v, n(90.0)])
            .unwrap()
            .as_numeric_array()
            .unwrap();
        assert!(out[0].abs() < 1e-9);
        assert!((out[1] - 1.0).abs() < 1e-9);
        assert_eq!(out[2], 5.0);
    }

    #[test]
    fn color_similarity_bounds() {
        assert_eq!(
            call_nums("color_similarity", &[10.0, 20.0, 30.0, 10.0, 20.0, 30.0]),
            n(1.0),
        );
        let far = call_nums("color_similarity", &[0.0, 0.0, 0.0, 255.0, 255.0, 255.0])
            .unwrap()
            .as_number()
            .unwrap();
        assert!(far.abs() < 1e-9);
    }

    #[test]
    fn array_reducers() {
        let arr = || Some(Scalar::numbers(&[10.0, 20.0, 30.0, 40.0]));
        assert_eq!(call("mean", &[arr()]), n(25.0));
        assert_eq!(call("sum", &[arr()]), n(100.0));
        assert_eq!(call("p50", &[arr()]), n(25.0));
        assert_eq!(call("percentile", &[arr(), n(100.0)]), n(40.0));
    }

    #[test]
    fn unknown_function_is_nil() {
        assert_eq!(call_nums("frobnicate", &[1.0]), None);
    }
}
